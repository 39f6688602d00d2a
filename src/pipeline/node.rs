//! Execution nodes: the runtime unit driving one operator.
//!
//! An execution node wraps exactly one operator. It instantiates the
//! operator's generator once, advances it one step per run, buffers what it
//! produces, and mediates demand with its neighbours:
//!
//! - **Upstream**: the node pulls from its previous node, sized to its own
//!   inbound headroom. The previous node answers by pushing a batch.
//! - **Downstream**: a consumer pulls from this node. The node pushes a
//!   batch once it buffered enough output or the pull's batch timeout
//!   fired, whichever comes first.
//!
//! # Architecture
//!
//! Each node is a tokio task (or, for detached operators, a dedicated OS
//! thread with its own current-thread runtime) running an event loop over:
//! its mailbox, acknowledgements of in-flight pushes, replies to its own
//! pull, the state of its previous node, operator wake-ups, the pending
//! pull's deadline and a backoff timer. All node state is owned by that
//! loop; peers only ever exchange messages.
//!
//! # Lifecycle
//!
//! `Uninstantiated → Running → Draining → Terminated`. Termination cascades
//! upstream (the previous node is told to stop) and answers any pending
//! downstream pull with [`PullReply::Exhausted`].

use crate::config::DemandSettings;
use crate::data::{Chunk, TableSlice};
use crate::error::{PipelineError, Result};
use crate::pipeline::bridge::{
    ExitReason, NodeHandle, NodeMessage, NodeSnapshot, NodeState, PullReply, SinkHandle,
};
use crate::pipeline::buffer::{Outbound, SharedInbound};
use crate::pipeline::context::{EngineContext, NodeWaker, OperatorControl};
use crate::pipeline::diagnostic::Diagnostic;
use crate::pipeline::element::{total_size, Batch, Element, ElementType, Void};
use crate::pipeline::generator::{BoxGenerator, Step};
use crate::pipeline::id::NodeId;
use crate::pipeline::operator::{Operator, OperatorInput};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Spawn an execution node for `op`, which receives `input`.
///
/// Returns the node's handle and its output type. The node idles until it
/// receives `start`.
pub fn spawn_exec_node(
    op: Box<dyn Operator>,
    input: ElementType,
    engine: &EngineContext,
) -> Result<(NodeHandle, ElementType)> {
    use ElementType::{Bytes, Events};
    let output = op.infer_type(input)?;
    let handle = match (input, output) {
        (ElementType::Void, ElementType::Void) => spawn_typed::<Void, Void>(op, engine)?,
        (ElementType::Void, Bytes) => spawn_typed::<Void, Chunk>(op, engine)?,
        (ElementType::Void, Events) => spawn_typed::<Void, TableSlice>(op, engine)?,
        (Bytes, ElementType::Void) => spawn_typed::<Chunk, Void>(op, engine)?,
        (Bytes, Bytes) => spawn_typed::<Chunk, Chunk>(op, engine)?,
        (Bytes, Events) => spawn_typed::<Chunk, TableSlice>(op, engine)?,
        (Events, ElementType::Void) => spawn_typed::<TableSlice, Void>(op, engine)?,
        (Events, Bytes) => spawn_typed::<TableSlice, Chunk>(op, engine)?,
        (Events, Events) => spawn_typed::<TableSlice, TableSlice>(op, engine)?,
    };
    Ok((handle, output))
}

fn spawn_typed<I: Element, O: Element>(
    op: Box<dyn Operator>,
    engine: &EngineContext,
) -> Result<NodeHandle> {
    let id = NodeId::next();
    let name = op.name().to_string();
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(NodeState::Uninstantiated);
    let handle = NodeHandle::new(id, &name, mailbox_tx, state_rx);

    let overrides = op.demand();
    let config = engine.config();
    let inbound_demand = config.demand_for(I::TYPE).with_overrides(&overrides);
    let outbound_demand = config.demand_for(O::TYPE).with_overrides(&overrides);
    for settings in [&inbound_demand, &outbound_demand] {
        settings.validate().map_err(|e| {
            PipelineError::Config(format!("demand of `{}`: {}", name, e))
        })?;
    }
    let ctrl = OperatorControl::new(id, name.clone(), engine.clone());
    let detached = op.detached();
    let node = ExecNode::<I, O> {
        id,
        waker: ctrl.waker(),
        ctrl,
        idle_after: op.idle_after(),
        inbound_demand,
        outbound_demand,
        op,
        mailbox: mailbox_rx,
        sink: handle.sink(),
        state: state_tx,
        instance: None,
        exhausted: false,
        paused: false,
        run_scheduled: false,
        steps: 0,
        backoff: None,
        backoff_until: None,
        previous: None,
        inbound: (I::TYPE != ElementType::Void).then(SharedInbound::new),
        inflight_pull: None,
        outbound: Outbound::new(),
        overflow: None,
        pull: None,
        inflight_push: None,
        inflight_push_size: 0,
        reject_pulls: false,
        finished: None,
        name,
    };

    if detached {
        std::thread::Builder::new()
            .name(format!("slipstream-{}", node.name))
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(node.run()),
                    Err(e) => node.terminate(Err(PipelineError::Io(format!(
                        "failed to build runtime for detached operator: {}",
                        e
                    )))),
                }
            })
            .map_err(|e| {
                PipelineError::Io(format!("failed to spawn thread for `{}`: {}", handle.operator(), e))
            })?;
    } else {
        engine.runtime().spawn(node.run());
    }
    tracing::debug!("Spawned {} `{}` ({} -> {})", id, handle.operator(), I::TYPE, O::TYPE);
    Ok(handle)
}

struct Upstream {
    handle: NodeHandle,
    state: watch::Receiver<NodeState>,
}

struct PullRequest {
    sink: SinkHandle,
    batch_size: u64,
    deadline: Instant,
    reply: oneshot::Sender<Result<PullReply>>,
}

/// Outcome of one attempt to advance the generator.
enum Advance {
    /// Output was buffered, or a sink consumed a step.
    Produced,
    /// The generator was stepped but had nothing ready.
    Stalled,
    /// The outbound buffer is full; the generator was not stepped.
    Blocked,
    Exhausted,
}

struct ExecNode<I: Element, O: Element> {
    id: NodeId,
    name: String,
    op: Box<dyn Operator>,
    ctrl: OperatorControl,
    waker: NodeWaker,
    mailbox: mpsc::UnboundedReceiver<NodeMessage>,
    /// Our own address, passed along with pulls to the previous node.
    sink: SinkHandle,
    state: watch::Sender<NodeState>,
    inbound_demand: DemandSettings,
    outbound_demand: DemandSettings,
    idle_after: Duration,

    instance: Option<BoxGenerator<O>>,
    exhausted: bool,
    paused: bool,
    run_scheduled: bool,
    steps: u64,
    backoff: Option<Duration>,
    backoff_until: Option<Instant>,

    // Upstream side; unused by sources.
    previous: Option<Upstream>,
    inbound: Option<SharedInbound<I>>,
    inflight_pull: Option<oneshot::Receiver<Result<PullReply>>>,

    // Downstream side; unused by sinks.
    outbound: Outbound<O>,
    /// Remainder of a unit that did not fit into the outbound buffer.
    overflow: Option<O>,
    pull: Option<PullRequest>,
    inflight_push: Option<oneshot::Receiver<Result<()>>>,
    inflight_push_size: u64,
    reject_pulls: bool,

    finished: Option<ExitReason>,
}

impl<I: Element, O: Element> ExecNode<I, O> {
    async fn run(mut self) {
        let outcome = self.event_loop().await;
        self.terminate(outcome);
    }

    async fn event_loop(&mut self) -> Result<ExitReason> {
        loop {
            if let Some(reason) = self.finished.take() {
                return Ok(reason);
            }
            let pull_deadline = self.pull_deadline();
            let backoff_until = if self.paused { None } else { self.backoff_until };
            let run_now = self.run_scheduled && !self.paused;

            tokio::select! {
                biased;
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => self.handle_message(msg)?,
                    None => return Ok(ExitReason::Normal),
                },
                state = upstream_changed(&mut self.previous) => {
                    self.on_upstream_state(state)?;
                }
                ack = recv_slot(&mut self.inflight_push) => {
                    self.inflight_push = None;
                    self.on_push_ack(ack)?;
                }
                reply = recv_slot(&mut self.inflight_pull) => {
                    self.inflight_pull = None;
                    self.on_pull_reply(reply)?;
                }
                _ = self.waker.woken() => self.schedule_run(),
                // An expired deadline stays ready; it must not starve the run branch.
                _ = sleep_until(pull_deadline), if !run_now => self.schedule_run(),
                _ = sleep_until(backoff_until), if !run_now => {
                    self.backoff_until = None;
                    self.schedule_run();
                }
                _ = std::future::ready(()), if run_now => {
                    self.run_scheduled = false;
                    self.run_once()?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: NodeMessage) -> Result<()> {
        match msg {
            NodeMessage::Start { previous, reply } => self.on_start(previous, reply)?,
            NodeMessage::Push { batch, reply } => self.on_push(batch, reply),
            NodeMessage::Pull {
                sink,
                batch_size,
                batch_timeout,
                reply,
            } => self.on_pull(sink, batch_size, batch_timeout, reply),
            NodeMessage::Pause => {
                tracing::debug!("{} `{}` paused", self.id, self.name);
                self.paused = true;
            }
            NodeMessage::Resume => {
                tracing::debug!("{} `{}` resumed", self.id, self.name);
                self.paused = false;
                self.schedule_run();
            }
            NodeMessage::Shutdown { reason } => {
                tracing::debug!("{} `{}` received shutdown", self.id, self.name);
                self.finished = Some(reason);
            }
            NodeMessage::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    fn on_start(
        &mut self,
        mut previous: Vec<NodeHandle>,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.instance.is_some() || self.exhausted {
            let _ = reply.send(Err(PipelineError::logic(format!(
                "{} `{}` was already started",
                self.id, self.name
            ))));
            return Ok(());
        }
        let is_source = I::TYPE == ElementType::Void;
        let invalid = if is_source && !previous.is_empty() {
            Some(format!(
                "{} `{}` runs a source operator and must not have a previous execution node",
                self.id, self.name
            ))
        } else if !is_source && previous.is_empty() {
            Some(format!(
                "{} `{}` runs a {} operator and needs a previous execution node",
                self.id,
                self.name,
                if O::TYPE == ElementType::Void { "sink" } else { "transform" }
            ))
        } else {
            None
        };
        if let Some(message) = invalid {
            let err = PipelineError::logic(message);
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }

        let input = match &self.inbound {
            Some(inbound) => I::into_input(Box::new(inbound.reader())),
            None => OperatorInput::Void,
        };
        let instance = self
            .op
            .instantiate(input, &self.ctrl)
            .and_then(O::from_output)
            .map_err(|e| e.with_context(format!("failed to instantiate `{}`", self.name)));
        let instance = match instance {
            Ok(instance) => instance,
            Err(err) => {
                let _ = reply.send(Err(err.clone()));
                return Err(err);
            }
        };
        self.instance = Some(instance);
        self.state.send_replace(NodeState::Running);
        self.schedule_run();
        tracing::debug!("{} `{}` instantiated", self.id, self.name);

        match previous.pop() {
            Some(handle) => {
                tracing::debug!(
                    "{} `{}` delegates start to {} `{}`",
                    self.id,
                    self.name,
                    handle.id(),
                    handle.operator()
                );
                handle.forward_start(previous, reply)?;
                self.previous = Some(Upstream {
                    state: handle.watch_state(),
                    handle,
                });
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
        Ok(())
    }

    fn on_upstream_state(&mut self, state: NodeState) -> Result<()> {
        match state {
            NodeState::Terminated(ExitReason::Normal) => {
                tracing::debug!("{} `{}` saw its previous node finish", self.id, self.name);
                self.previous = None;
                self.close_inbound();
                self.schedule_run();
                Ok(())
            }
            NodeState::Terminated(ExitReason::Error(diag)) => {
                Err(PipelineError::UpstreamFailed(diag))
            }
            _ => Ok(()),
        }
    }

    fn close_inbound(&mut self) {
        if let Some(inbound) = &self.inbound {
            inbound.lock().close_upstream();
        }
    }

    fn terminate(mut self, outcome: Result<ExitReason>) {
        let reason = match outcome {
            Ok(reason) => reason,
            Err(PipelineError::UpstreamFailed(diag)) => ExitReason::Error(diag),
            Err(err) => {
                let diag = err
                    .to_diagnostic()
                    .with_note(format!("in `{}` ({})", self.name, self.id));
                self.ctrl.engine().diagnostics().emit(diag.clone());
                ExitReason::Error(diag)
            }
        };
        match &reason {
            ExitReason::Normal => tracing::debug!("{} `{}` terminated", self.id, self.name),
            ExitReason::Error(diag) => {
                tracing::debug!("{} `{}` terminated: {}", self.id, self.name, diag)
            }
        }

        if let Some(previous) = self.previous.take() {
            previous.handle.shutdown(ExitReason::Normal);
        }
        self.instance = None;
        self.reject_pulls = true;
        // Publish before closing the mailbox or answering pulls so consumers
        // observe an error exit ahead of the exhausted reply.
        self.state.send_replace(NodeState::Terminated(reason));
        self.mailbox.close();

        if let Some(pull) = self.pull.take() {
            let _ = pull.reply.send(Ok(PullReply::Exhausted));
        }
        while let Ok(msg) = self.mailbox.try_recv() {
            match msg {
                NodeMessage::Pull { reply, .. } => {
                    let _ = reply.send(Ok(PullReply::Exhausted));
                }
                NodeMessage::Start { reply, .. } => {
                    let _ = reply.send(Err(PipelineError::logic(format!(
                        "{} `{}` already terminated",
                        self.id, self.name
                    ))));
                }
                // Dropping a push's reply tells its sender we are gone.
                _ => {}
            }
        }
    }

    // ── Downstream: pulls and deliveries ──────────────────────────────

    fn on_pull(
        &mut self,
        sink: SinkHandle,
        batch_size: u64,
        batch_timeout: Duration,
        reply: oneshot::Sender<Result<PullReply>>,
    ) {
        if O::TYPE == ElementType::Void {
            let _ = reply.send(Err(PipelineError::logic(format!(
                "{} `{}` runs a sink and cannot be pulled from",
                self.id, self.name
            ))));
            return;
        }
        if self.pull.is_some() {
            let _ = reply.send(Err(PipelineError::logic(format!(
                "concurrent pull from {} `{}`",
                self.id, self.name
            ))));
            return;
        }
        if self.reject_pulls {
            let _ = reply.send(Ok(PullReply::Exhausted));
            return;
        }
        if batch_size == 0 {
            let _ = reply.send(Ok(PullReply::Delivered { size: 0 }));
            return;
        }
        self.pull = Some(PullRequest {
            sink,
            batch_size,
            deadline: Instant::now() + batch_timeout,
            reply,
        });
        self.schedule_run();
    }

    fn pull_deadline(&self) -> Option<Instant> {
        if self.paused || self.instance.is_none() || self.inflight_push.is_some() {
            return None;
        }
        self.pull.as_ref().map(|pull| pull.deadline)
    }

    /// Satisfy the open pull if enough output is buffered, its deadline
    /// passed, or `force` is set.
    fn deliver(&mut self, now: Instant, force: bool) {
        if self.inflight_push.is_some() {
            return;
        }
        let Some(pull) = &self.pull else {
            return;
        };
        let ready = force || self.outbound.size() >= pull.batch_size || now >= pull.deadline;
        if !ready {
            return;
        }
        let units = self.outbound.take(pull.batch_size);
        if units.is_empty() {
            if let Some(pull) = self.pull.take() {
                let _ = pull.reply.send(Ok(PullReply::Delivered { size: 0 }));
            }
            return;
        }
        let size = total_size(&units);
        let Some(batch) = O::into_batch(units) else {
            return;
        };
        tracing::trace!("{} `{}` delivers {} of {}", self.id, self.name, size, pull.batch_size);
        match pull.sink.push(batch) {
            Some(ack) => {
                self.inflight_push = Some(ack);
                self.inflight_push_size = size;
            }
            None => self.downstream_gone(),
        }
    }

    fn on_push_ack(&mut self, ack: std::result::Result<Result<()>, oneshot::error::RecvError>) -> Result<()> {
        let size = std::mem::take(&mut self.inflight_push_size);
        match ack {
            Ok(Ok(())) => {
                if let Some(pull) = self.pull.take() {
                    let _ = pull.reply.send(Ok(PullReply::Delivered { size }));
                }
                self.schedule_run();
                Ok(())
            }
            Ok(Err(err)) => {
                if let Some(pull) = self.pull.take() {
                    let _ = pull.reply.send(Err(err.clone()));
                }
                Err(err.with_context("downstream rejected a delivery"))
            }
            Err(_) => {
                self.downstream_gone();
                Ok(())
            }
        }
    }

    fn downstream_gone(&mut self) {
        tracing::debug!("{} `{}` lost its downstream consumer", self.id, self.name);
        self.pull = None;
        self.finished = Some(ExitReason::Normal);
    }

    // ── Upstream: pushes and demand ───────────────────────────────────

    fn on_push(&mut self, batch: Batch, reply: oneshot::Sender<Result<()>>) {
        let Some(inbound) = &self.inbound else {
            let _ = reply.send(Err(PipelineError::logic(format!(
                "{} `{}` runs a source and does not accept input",
                self.id, self.name
            ))));
            return;
        };
        let units = match I::from_batch(batch) {
            Ok(units) => units,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let size = total_size(&units);
        let mut buffer = inbound.lock();
        let max = self.inbound_demand.max_buffered;
        if buffer.size() + size > max {
            let buffered = buffer.size();
            drop(buffer);
            let _ = reply.send(Err(PipelineError::logic(format!(
                "inbound buffer full: {} `{}` holds {} and cannot take {} more (max {})",
                self.id, self.name, buffered, size, max
            ))));
            return;
        }
        buffer.append(units);
        drop(buffer);
        let _ = reply.send(Ok(()));
        self.schedule_run();
    }

    fn on_pull_reply(
        &mut self,
        reply: std::result::Result<Result<PullReply>, oneshot::error::RecvError>,
    ) -> Result<()> {
        match reply {
            Ok(Ok(PullReply::Delivered { .. })) => {}
            Ok(Ok(PullReply::Exhausted)) => {
                if let Some(previous) = self.previous.take() {
                    if let NodeState::Terminated(ExitReason::Error(diag)) = previous.handle.state() {
                        return Err(PipelineError::UpstreamFailed(diag));
                    }
                }
                tracing::debug!("{} `{}` drained its previous node", self.id, self.name);
                self.close_inbound();
            }
            Ok(Err(err)) => {
                return Err(err.with_context("pull from previous execution node failed"));
            }
            // The previous node went away; its state tells us how.
            Err(_) => {}
        }
        self.schedule_run();
        Ok(())
    }

    /// Ask the previous node for more input if there is enough headroom.
    fn request_more_input(&mut self) {
        let (Some(inbound), Some(previous)) = (&self.inbound, &self.previous) else {
            return;
        };
        if self.inflight_pull.is_some() {
            return;
        }
        let buffered = inbound.lock().size();
        let demand = &self.inbound_demand;
        let batch_size = demand
            .max_buffered
            .saturating_sub(buffered)
            .min(demand.max_batch_size);
        if batch_size == 0 || (buffered > 0 && batch_size < demand.min_batch_size) {
            return;
        }
        tracing::trace!("{} `{}` requests {}", self.id, self.name, batch_size);
        self.inflight_pull = Some(previous.handle.send_pull(
            self.sink.clone(),
            batch_size,
            demand.batch_timeout(),
        ));
    }

    // ── Scheduling ────────────────────────────────────────────────────

    fn schedule_run(&mut self) {
        self.run_scheduled = true;
    }

    fn run_once(&mut self) -> Result<()> {
        if self.paused || self.instance.is_none() || self.finished.is_some() {
            return Ok(());
        }
        if self.exhausted {
            self.drain();
            return Ok(());
        }
        let now = Instant::now();
        self.deliver(now, false);
        self.request_more_input();

        let consumed_before = self.consumed();
        let advance = self.advance()?;
        if let Some(diag) = self.ctrl.take_fatal() {
            return Err(PipelineError::Diagnostic(diag));
        }
        let consumed_input = self.consumed() != consumed_before;
        match advance {
            Advance::Produced | Advance::Exhausted => {
                self.reset_backoff();
                self.schedule_run();
            }
            Advance::Stalled if consumed_input => {
                self.reset_backoff();
                self.schedule_run();
            }
            Advance::Stalled => {
                if !self.input_starved() {
                    self.arm_backoff(now);
                }
            }
            Advance::Blocked => {}
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Advance> {
        if O::TYPE != ElementType::Void {
            if self.outbound.size() >= self.outbound_demand.max_buffered {
                return Ok(Advance::Blocked);
            }
            if let Some(rest) = self.overflow.take() {
                self.buffer_output(rest);
                return Ok(Advance::Produced);
            }
        }
        let Some(instance) = self.instance.as_mut() else {
            return Ok(Advance::Blocked);
        };
        self.steps += 1;
        match instance.next()? {
            Step::Item(_) if O::TYPE == ElementType::Void => Ok(Advance::Produced),
            Step::Item(unit) if unit.size() == 0 => Ok(Advance::Stalled),
            Step::Item(unit) => {
                self.buffer_output(unit);
                Ok(Advance::Produced)
            }
            Step::Pending => Ok(Advance::Stalled),
            Step::Done => {
                tracing::debug!("{} `{}` exhausted its generator", self.id, self.name);
                self.exhausted = true;
                if O::TYPE != ElementType::Void {
                    self.state.send_replace(NodeState::Draining);
                }
                Ok(Advance::Exhausted)
            }
        }
    }

    /// Buffer `unit`, keeping the outbound buffer within its bound. The
    /// part that does not fit waits in the overflow slot.
    fn buffer_output(&mut self, unit: O) {
        let headroom = self
            .outbound_demand
            .max_buffered
            .saturating_sub(self.outbound.size());
        let size = unit.size();
        if size <= headroom {
            self.outbound.push(unit);
        } else if headroom == 0 {
            self.overflow = Some(unit);
        } else {
            let (head, tail) = unit.split_at(headroom);
            self.outbound.push(head);
            self.overflow = Some(tail);
        }
    }

    /// Generator exhausted: stop upstream, flush what is buffered, then
    /// finish.
    fn drain(&mut self) {
        if let Some(previous) = self.previous.take() {
            tracing::debug!(
                "{} `{}` shuts down {} `{}`",
                self.id,
                self.name,
                previous.handle.id(),
                previous.handle.operator()
            );
            previous.handle.shutdown(ExitReason::Normal);
        }
        self.inflight_pull = None;
        self.close_inbound();

        if O::TYPE == ElementType::Void {
            self.finished = Some(ExitReason::Normal);
            return;
        }
        if self.outbound.size() < self.outbound_demand.max_buffered {
            if let Some(rest) = self.overflow.take() {
                self.buffer_output(rest);
            }
        }
        if self.outbound.is_empty() && self.overflow.is_none() {
            if self.inflight_push.is_none() {
                self.reject_pulls = true;
                if let Some(pull) = self.pull.take() {
                    let _ = pull.reply.send(Ok(PullReply::Exhausted));
                }
                self.finished = Some(ExitReason::Normal);
            }
            return;
        }
        self.deliver(Instant::now(), true);
    }

    fn consumed(&self) -> u64 {
        self.inbound.as_ref().map_or(0, |i| i.lock().consumed())
    }

    fn input_starved(&self) -> bool {
        self.inbound.as_ref().is_some_and(|inbound| {
            let inbound = inbound.lock();
            inbound.is_empty() && inbound.upstream_open()
        })
    }

    fn arm_backoff(&mut self, now: Instant) {
        let settings = &self.outbound_demand;
        let next = match self.backoff {
            None => settings.min_backoff(),
            Some(current) => current.mul_f64(settings.backoff_rate).min(settings.max_backoff()),
        }
        .max(self.idle_after);
        self.backoff = Some(next);
        self.backoff_until = Some(now + next);
    }

    fn reset_backoff(&mut self) {
        self.backoff = None;
        self.backoff_until = None;
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            operator: self.name.clone(),
            state: self.state.borrow().clone(),
            inbound_size: self.inbound.as_ref().map_or(0, |i| i.lock().size()),
            outbound_size: self.outbound.size(),
            steps: self.steps,
            paused: self.paused,
            has_pull_request: self.pull.is_some(),
        }
    }
}

async fn recv_slot<T>(
    slot: &mut Option<oneshot::Receiver<T>>,
) -> std::result::Result<T, oneshot::error::RecvError> {
    match slot {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

async fn upstream_changed(previous: &mut Option<Upstream>) -> NodeState {
    let Some(upstream) = previous else {
        return std::future::pending().await;
    };
    match upstream.state.changed().await {
        Ok(()) => upstream.state.borrow_and_update().clone(),
        Err(_) => match &*upstream.state.borrow() {
            NodeState::Terminated(reason) => NodeState::Terminated(reason.clone()),
            _ => NodeState::Terminated(ExitReason::Error(Diagnostic::error(format!(
                "previous execution node {} `{}` vanished",
                upstream.handle.id(),
                upstream.handle.operator()
            )))),
        },
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::data::{DataType, Field, Schema, TableSliceBuilder, Value};
    use crate::pipeline::bridge::SinkHandle;
    use crate::pipeline::generator::{from_fn, from_iter, GeneratorExt};
    use crate::pipeline::operator::OperatorOutput;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Rows {
        batches: Vec<u64>,
    }

    fn slice(rows: u64) -> TableSlice {
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", DataType::Int64)]));
        let mut builder = TableSliceBuilder::new(schema);
        for i in 0..rows {
            builder.push_row(vec![Value::Int64(i as i64)]).unwrap();
        }
        builder.finish().unwrap()
    }

    impl Operator for Rows {
        fn name(&self) -> &str {
            "rows"
        }

        fn infer_type(&self, input: ElementType) -> Result<ElementType> {
            crate::pipeline::operator::expect_input(
                self.name(),
                input,
                ElementType::Void,
                ElementType::Events,
            )
        }

        fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
            input.expect_void(self.name())?;
            let slices: Vec<TableSlice> = self.batches.iter().map(|&n| slice(n)).collect();
            Ok(OperatorOutput::Events(from_iter(slices).boxed()))
        }

        fn copy(&self) -> Box<dyn Operator> {
            Box::new(self.clone())
        }
    }

    #[derive(Debug, Clone)]
    struct Failing;

    impl Operator for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn infer_type(&self, _input: ElementType) -> Result<ElementType> {
            Ok(ElementType::Events)
        }

        fn instantiate(&self, _input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
            let ctrl = ctrl.clone();
            Ok(OperatorOutput::Events(
                from_fn(move || {
                    ctrl.error("broken generator");
                    Ok(Step::<TableSlice>::Pending)
                })
                .boxed(),
            ))
        }

        fn copy(&self) -> Box<dyn Operator> {
            Box::new(self.clone())
        }
    }

    async fn engine() -> EngineContext {
        EngineContext::new(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_source_delivers_then_exhausts() {
        let engine = engine().await;
        let (node, output) =
            spawn_exec_node(Box::new(Rows { batches: vec![3, 4] }), ElementType::Void, &engine)
                .unwrap();
        assert_eq!(output, ElementType::Events);
        node.start(Vec::new()).await.unwrap();

        let (sink, mut incoming) = SinkHandle::channel();
        let puller = node.clone();
        let pull = tokio::spawn(async move {
            puller.pull(sink, 100, Duration::from_millis(10)).await
        });
        let push = incoming.recv().await.unwrap();
        assert_eq!(push.batch().size(), 7);
        push.accept();
        assert_eq!(pull.await.unwrap().unwrap(), PullReply::Delivered { size: 7 });

        let (sink, _incoming) = SinkHandle::channel();
        let reply = node.pull(sink, 100, Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply, PullReply::Exhausted);
        assert_eq!(node.terminated().await, ExitReason::Normal);
    }

    #[tokio::test]
    async fn test_start_twice_is_logic_error() {
        let engine = engine().await;
        let (node, _) =
            spawn_exec_node(Box::new(Rows { batches: vec![1] }), ElementType::Void, &engine)
                .unwrap();
        node.start(Vec::new()).await.unwrap();
        let err = node.start(Vec::new()).await.unwrap_err();
        assert!(err.is_logic());
        node.shutdown(ExitReason::Normal);
    }

    #[tokio::test]
    async fn test_source_with_previous_is_rejected() {
        let engine = engine().await;
        let (a, _) =
            spawn_exec_node(Box::new(Rows { batches: vec![1] }), ElementType::Void, &engine)
                .unwrap();
        let (b, _) =
            spawn_exec_node(Box::new(Rows { batches: vec![1] }), ElementType::Void, &engine)
                .unwrap();
        let err = b.start(vec![a.clone()]).await.unwrap_err();
        assert!(err.to_string().contains("must not have a previous execution node"));
        assert!(b.terminated().await.is_error());
        a.shutdown(ExitReason::Normal);
    }

    #[tokio::test]
    async fn test_fatal_diagnostic_terminates_node() {
        let engine = engine().await;
        let (node, _) = spawn_exec_node(Box::new(Failing), ElementType::Void, &engine).unwrap();
        node.start(Vec::new()).await.unwrap();
        match node.terminated().await {
            ExitReason::Error(diag) => assert_eq!(diag.message, "broken generator"),
            ExitReason::Normal => panic!("expected an error exit"),
        }
    }
}
