//! Sinks: operators that consume without producing.

use crate::data::TableSlice;
use crate::error::{PipelineError, Result};
use crate::pipeline::context::{NodeWaker, OperatorControl};
use crate::pipeline::element::{ElementType, Void};
use crate::pipeline::generator::{from_fn, BoxGenerator, Generator, GeneratorExt, Step};
use crate::pipeline::operator::{
    expect_input, Operator, OperatorConfig, OperatorInput, OperatorOutput,
};
use crossbeam_channel::{Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Drops its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discard;

impl Operator for Discard {
    fn name(&self) -> &str {
        "discard"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        match input {
            ElementType::Events | ElementType::Bytes => Ok(ElementType::Void),
            ElementType::Void => Err(PipelineError::TypeMismatch(
                "operator `discard` expects events or bytes input but got void".to_string(),
            )),
        }
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let gen = match input {
            OperatorInput::Events(gen) => gen.map_items(|_| Ok(Void)).boxed(),
            OperatorInput::Bytes(gen) => gen.map_items(|_| Ok(Void)).boxed(),
            OperatorInput::Void => {
                return Err(PipelineError::TypeMismatch(
                    "operator `discard` expects events or bytes input but got void".to_string(),
                ))
            }
        };
        Ok(OperatorOutput::Void(gen))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(*self)
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        Ok(OperatorConfig::new(self.name(), serde_json::json!({})))
    }
}

/// Sends every non-empty slice to a channel. Completes early once the
/// receiving side was dropped.
///
/// A bounded channel blocks the sender while full, so the node runs on a
/// thread of its own.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<TableSlice>,
}

impl ChannelSink {
    pub fn new(tx: Sender<TableSlice>) -> Self {
        Self { tx }
    }
}

impl Operator for ChannelSink {
    fn name(&self) -> &str {
        "channel_sink"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Void)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let mut input = input.into_events(self.name())?;
        let tx = self.tx.clone();
        let ctrl = ctrl.clone();
        let gen = from_fn(move || match input.next()? {
            Step::Item(slice) => {
                if slice.rows() > 0 && tx.send(slice).is_err() {
                    ctrl.warn("channel sink receiver disconnected; discarding remaining input");
                    return Ok(Step::Done);
                }
                Ok(Step::Item(Void))
            }
            Step::Pending => Ok(Step::Pending),
            Step::Done => Ok(Step::Done),
        });
        Ok(OperatorOutput::Void(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn detached(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct Producers {
    next_key: u64,
    wakers: HashMap<u64, NodeWaker>,
}

/// Wakers of the nodes feeding a shared channel, so the consumer can wake
/// them after making room.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProducerWakers(Arc<Mutex<Producers>>);

impl ProducerWakers {
    fn lock(&self) -> MutexGuard<'_, Producers> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `waker` until the returned guard is dropped.
    pub(crate) fn register(&self, waker: NodeWaker) -> ProducerRegistration {
        let mut producers = self.lock();
        let key = producers.next_key;
        producers.next_key += 1;
        producers.wakers.insert(key, waker);
        ProducerRegistration {
            producers: self.clone(),
            key,
        }
    }

    pub(crate) fn wake_all(&self) {
        for waker in self.lock().wakers.values() {
            waker.wake();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().wakers.len()
    }
}

/// Keeps a producer's waker registered while alive.
#[derive(Debug)]
pub(crate) struct ProducerRegistration {
    producers: ProducerWakers,
    key: u64,
}

impl Drop for ProducerRegistration {
    fn drop(&mut self) {
        self.producers.lock().wakers.remove(&self.key);
    }
}

/// Forwards slices into a bounded channel shared by several pipelines,
/// holding a slice back while the channel is full. Wakes `consumer` after
/// every send.
#[derive(Debug, Clone)]
pub(crate) struct ForwardSink {
    pub(crate) tx: Sender<TableSlice>,
    pub(crate) producers: ProducerWakers,
    pub(crate) consumer: NodeWaker,
}

struct Forwarder {
    input: BoxGenerator<TableSlice>,
    tx: Sender<TableSlice>,
    consumer: NodeWaker,
    held: Option<TableSlice>,
    _registration: Option<ProducerRegistration>,
}

impl Generator for Forwarder {
    type Item = Void;

    fn next(&mut self) -> Result<Step<Void>> {
        let slice = match self.held.take() {
            Some(slice) => slice,
            None => match self.input.next()? {
                Step::Item(slice) if slice.rows() > 0 => slice,
                Step::Item(_) | Step::Pending => return Ok(Step::Pending),
                Step::Done => return Ok(Step::Done),
            },
        };
        match self.tx.try_send(slice) {
            Ok(()) => {
                self.consumer.wake();
                Ok(Step::Item(Void))
            }
            Err(TrySendError::Full(slice)) => {
                self.held = Some(slice);
                Ok(Step::Pending)
            }
            // Nobody wants our output anymore.
            Err(TrySendError::Disconnected(_)) => Ok(Step::Done),
        }
    }
}

impl Operator for ForwardSink {
    fn name(&self) -> &str {
        "forward"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Void)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let input = input.into_events(self.name())?;
        Ok(OperatorOutput::Void(
            Forwarder {
                input,
                tx: self.tx.clone(),
                consumer: self.consumer.clone(),
                held: None,
                _registration: Some(self.producers.register(ctrl.waker())),
            }
            .boxed(),
        ))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}
