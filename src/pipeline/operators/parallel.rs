//! The `parallel` operator: run `jobs` copies of a sub-pipeline over one
//! input stream.
//!
//! # Architecture
//!
//! ```text
//!                   ┌─► worker 0: [work source | sub-pipeline | result sink] ─┐
//! input ─► split ─► work ─► worker 1 ...                                      ├─► results ─► output
//!                   └─► worker N ─────────────────────────────────────────────┘
//! ```
//!
//! Each worker is a full pipeline with its own execution nodes, started on
//! the engine runtime. The operator's own generator is the transceiver: it
//! splits oversized input slices, hands them to whichever worker takes
//! them next through a bounded work channel, and yields whatever the
//! workers put into the bounded result channel. Both channels apply
//! backpressure in their direction. Nodes on either side of a channel wake
//! each other when they make room or provide data.
//!
//! Results carry no ordering guarantee across workers.

use crate::data::TableSlice;
use crate::error::{PipelineError, Result};
use crate::pipeline::chain::Pipeline;
use crate::pipeline::context::{NodeWaker, OperatorControl};
use crate::pipeline::element::{ElementType, Void};
use crate::pipeline::executor::PipelineExecutor;
use crate::pipeline::expression::{EventOrder, Expression};
use crate::pipeline::generator::{BoxGenerator, Generator, GeneratorExt, Step};
use crate::pipeline::operators::sink::{ForwardSink, ProducerRegistration, ProducerWakers};
use crate::pipeline::operator::{
    expect_input, Location, Operator, OperatorConfig, OperatorInput, OperatorOutput,
    OptimizeResult,
};
use crate::pipeline::registry::OperatorRegistry;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

#[derive(Debug, Serialize, Deserialize)]
struct ParallelArgs {
    #[serde(default = "default_jobs")]
    jobs: usize,
    pipeline: Vec<OperatorConfig>,
}

#[derive(Debug, Clone)]
pub struct Parallel {
    jobs: usize,
    pipeline: Pipeline,
}

impl Parallel {
    pub fn new(jobs: usize, pipeline: Pipeline) -> Self {
        Self { jobs, pipeline }
    }

    pub fn from_config(config: &OperatorConfig, registry: &OperatorRegistry) -> Result<Box<dyn Operator>> {
        let args: ParallelArgs = config.args()?;
        Ok(Box::new(Self::new(args.jobs, registry.build_pipeline(&args.pipeline)?)))
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Type of the workers' output, which must be events or nothing.
    fn worker_output(&self) -> Result<ElementType> {
        match self.pipeline.infer_type(ElementType::Events)? {
            ElementType::Bytes => Err(PipelineError::TypeMismatch(
                "the pipeline of `parallel` must return events or void, not bytes".to_string(),
            )),
            other => Ok(other),
        }
    }
}

/// Split `slice` into pieces of roughly equal size holding at most about
/// `split_at` rows each.
pub fn split_slice(slice: &TableSlice, split_at: u64) -> Vec<TableSlice> {
    let rows = slice.rows();
    if rows == 0 {
        return Vec::new();
    }
    let split_at = split_at.max(1);
    let correction = u64::from(rows % split_at != 0);
    let splits = rows / split_at + correction;
    let size = rows / splits + correction;
    (0..splits)
        .map(|i| slice.subslice(size * i, rows.min(size * (i + 1))))
        .filter(|piece| piece.rows() > 0)
        .collect()
}

/// First operator of every worker: takes work off the shared channel.
#[derive(Debug, Clone)]
struct WorkSource {
    work: Receiver<TableSlice>,
    workers: ProducerWakers,
    parent: NodeWaker,
}

impl Operator for WorkSource {
    fn name(&self) -> &str {
        "parallel_work"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        Ok(OperatorOutput::Events(
            WorkReader {
                work: self.work.clone(),
                parent: self.parent.clone(),
                _registration: self.workers.register(ctrl.waker()),
            }
            .boxed(),
        ))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

struct WorkReader {
    work: Receiver<TableSlice>,
    parent: NodeWaker,
    _registration: ProducerRegistration,
}

impl Generator for WorkReader {
    type Item = TableSlice;

    fn next(&mut self) -> Result<Step<TableSlice>> {
        Ok(match self.work.try_recv() {
            Ok(slice) => {
                // The transceiver may be waiting for room.
                self.parent.wake();
                Step::Item(slice)
            }
            Err(TryRecvError::Empty) => Step::Pending,
            Err(TryRecvError::Disconnected) => Step::Done,
        })
    }
}

struct Transceiver {
    input: Option<BoxGenerator<TableSlice>>,
    split_at: u64,
    pending: VecDeque<TableSlice>,
    work: Option<Sender<TableSlice>>,
    results: Option<Receiver<TableSlice>>,
    finished: Receiver<(usize, Result<()>)>,
    running: usize,
    workers: ProducerWakers,
    // Dropping these cancels the workers.
    _cancel: Vec<oneshot::Sender<()>>,
}

impl Transceiver {
    fn wake_workers(&self) {
        self.workers.wake_all();
    }

    fn collect_finished(&mut self) -> Result<()> {
        while let Ok((index, result)) = self.finished.try_recv() {
            self.running = self.running.saturating_sub(1);
            result.map_err(|err| err.with_context(format!("parallel worker #{}", index)))?;
            tracing::debug!("parallel worker #{} finished, {} still running", index, self.running);
        }
        Ok(())
    }

    fn distribute(&mut self) {
        let Some(work) = self.work.as_ref() else {
            self.pending.clear();
            return;
        };
        let mut sent = false;
        let mut disconnected = false;
        while let Some(slice) = self.pending.pop_front() {
            match work.try_send(slice) {
                Ok(()) => sent = true,
                Err(TrySendError::Full(slice)) => {
                    self.pending.push_front(slice);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    disconnected = true;
                    break;
                }
            }
        }
        if disconnected {
            // Every worker stopped taking input.
            self.pending.clear();
            self.input = None;
            self.work = None;
        } else if sent {
            self.wake_workers();
        }
    }
}

impl Generator for Transceiver {
    type Item = TableSlice;

    fn next(&mut self) -> Result<Step<TableSlice>> {
        self.collect_finished()?;
        self.distribute();
        if let Some(slice) = self.results.as_ref().and_then(|rx| rx.try_recv().ok()) {
            self.wake_workers();
            return Ok(Step::Item(slice));
        }
        if self.running == 0 {
            self.input = None;
            return Ok(Step::Done);
        }
        if self.pending.is_empty() {
            if let Some(input) = self.input.as_mut() {
                match input.next()? {
                    Step::Item(slice) => {
                        self.pending.extend(split_slice(&slice, self.split_at));
                        self.distribute();
                    }
                    Step::Pending => {}
                    Step::Done => self.input = None,
                }
            }
            if self.input.is_none() && self.pending.is_empty() && self.work.take().is_some() {
                tracing::debug!("parallel input exhausted, waiting for {} workers", self.running);
                self.wake_workers();
            }
        }
        Ok(Step::Pending)
    }
}

impl Operator for Parallel {
    fn name(&self) -> &str {
        "parallel"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Events)?;
        self.worker_output()
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let input = input.into_events(self.name())?;
        if self.jobs == 0 {
            return Err(PipelineError::Config(
                "`parallel` needs at least one job".to_string(),
            ));
        }
        let output = self.worker_output()?;
        let settings = ctrl.config().parallel;
        let (work_tx, work_rx) = crossbeam_channel::bounded(settings.channel_capacity.max(1));
        let (results_tx, results_rx) = crossbeam_channel::bounded(settings.channel_capacity.max(1));
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let workers = ProducerWakers::default();
        let parent = ctrl.waker();

        let mut cancel = Vec::with_capacity(self.jobs);
        for index in 0..self.jobs {
            let mut pipeline = self.pipeline.clone();
            pipeline.prepend(Box::new(WorkSource {
                work: work_rx.clone(),
                workers: workers.clone(),
                parent: parent.clone(),
            }));
            if output == ElementType::Events {
                pipeline.push(Box::new(ForwardSink {
                    tx: results_tx.clone(),
                    producers: workers.clone(),
                    consumer: parent.clone(),
                }));
            }
            let (cancel_tx, mut cancelled) = oneshot::channel::<()>();
            let engine = ctrl.engine().clone();
            let done = done_tx.clone();
            let parent = parent.clone();
            ctrl.spawn(async move {
                let mut executor = PipelineExecutor::new(pipeline, engine);
                let result = tokio::select! {
                    result = executor.run() => result,
                    _ = &mut cancelled => Ok(()),
                };
                let _ = done.send((index, result));
                parent.wake();
            });
            cancel.push(cancel_tx);
        }
        tracing::debug!("{} spawned {} parallel workers", ctrl.node_id(), self.jobs);

        let transceiver = Transceiver {
            input: Some(input),
            split_at: settings.split_at,
            pending: VecDeque::new(),
            work: Some(work_tx),
            results: (output == ElementType::Events).then_some(results_rx),
            finished: done_rx,
            running: self.jobs,
            workers,
            _cancel: cancel,
        };
        Ok(match output {
            ElementType::Events => OperatorOutput::Events(transceiver.boxed()),
            _ => OperatorOutput::Void(transceiver.map_items(|_| Ok(Void)).boxed()),
        })
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn optimize(&self, _filter: &Expression, _order: EventOrder) -> OptimizeResult {
        OptimizeResult {
            filter: None,
            order: EventOrder::Unordered,
            replacement: Some(self.copy()),
        }
    }

    fn location(&self) -> Location {
        self.pipeline.location()
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        let pipeline = self
            .pipeline
            .operators()
            .iter()
            .map(|op| op.to_config())
            .collect::<Result<Vec<_>>>()?;
        OperatorConfig::from_args(
            self.name(),
            &ParallelArgs {
                jobs: self.jobs,
                pipeline,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field, Schema, Value};
    use crate::pipeline::expression::CompareOp;
    use crate::pipeline::operators::{Discard, Head, Where};
    use std::sync::Arc;

    fn slice(rows: u64) -> TableSlice {
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", DataType::Int64)]));
        let column = (0..rows as i64).map(Value::Int64).collect();
        TableSlice::new(schema, vec![column]).unwrap()
    }

    fn sizes(pieces: &[TableSlice]) -> Vec<u64> {
        pieces.iter().map(TableSlice::rows).collect()
    }

    #[test]
    fn test_split_small_slice_is_untouched() {
        assert_eq!(sizes(&split_slice(&slice(3), 5000)), [3]);
    }

    #[test]
    fn test_split_even() {
        assert_eq!(sizes(&split_slice(&slice(10_000), 5000)), [5000, 5000]);
    }

    #[test]
    fn test_split_uneven_keeps_all_rows() {
        let pieces = split_slice(&slice(12_000), 5000);
        assert_eq!(sizes(&pieces), [4001, 4001, 3998]);
        assert_eq!(pieces[2].value(0, 0), Some(&Value::Int64(8002)));
    }

    #[test]
    fn test_split_empty_slice() {
        assert!(split_slice(&slice(0), 10).is_empty());
    }

    #[test]
    fn test_infer_type() {
        let events = Parallel::new(2, Pipeline::default().then(Head::new(1)));
        assert_eq!(events.infer_type(ElementType::Events).unwrap(), ElementType::Events);
        assert!(events.infer_type(ElementType::Void).is_err());
        let void = Parallel::new(2, Pipeline::default().then(Discard));
        assert_eq!(void.infer_type(ElementType::Events).unwrap(), ElementType::Void);
    }

    #[test]
    fn test_optimize_degrades_order() {
        let op = Parallel::new(2, Pipeline::default().then(Head::new(1)));
        let result = op.optimize(&Expression::True, EventOrder::Ordered);
        assert_eq!(result.order, EventOrder::Unordered);
        assert!(result.filter.is_none());
    }

    #[test]
    fn test_config_round_trip() {
        let op = Parallel::new(
            3,
            Pipeline::default().then(Where::new(Expression::compare("x", CompareOp::Gt, 1i64))),
        );
        let config = op.to_config().unwrap();
        let rebuilt = Parallel::from_config(&config, &OperatorRegistry::with_builtins()).unwrap();
        assert_eq!(rebuilt.to_config().unwrap(), config);
    }
}
