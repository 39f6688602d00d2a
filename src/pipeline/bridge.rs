//! Message boundary between execution nodes.
//!
//! Every execution node owns an unbounded mailbox and processes its
//! messages one at a time, so no node state is ever touched by two tasks.
//! [`NodeHandle`] is the cloneable address of a node; [`SinkHandle`] is
//! the narrower address a downstream consumer passes along with a pull so
//! the producer knows where to push.
//!
//! # Protocol
//!
//! 1. The consumer sends `Pull { sink, batch_size, batch_timeout }`.
//! 2. The producer answers by sending `Push { batch }` to `sink` and
//!    waits for the consumer's acknowledgement.
//! 3. Once acknowledged, the producer replies to the pull with
//!    [`PullReply::Delivered`]. A producer that is done replies
//!    [`PullReply::Exhausted`] without pushing.

use crate::data::TableSlice;
use crate::error::{PipelineError, Result};
use crate::pipeline::diagnostic::Diagnostic;
use crate::pipeline::element::Batch;
use crate::pipeline::id::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Why a node terminated.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Exhausted, or asked to stop by a peer or the executor.
    Normal,
    /// Terminated by a fatal diagnostic.
    Error(Diagnostic),
}

impl ExitReason {
    pub fn is_error(&self) -> bool {
        matches!(self, ExitReason::Error(_))
    }
}

/// Lifecycle state published by every node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Uninstantiated,
    Running,
    /// Generator exhausted, buffered output remains.
    Draining,
    Terminated(ExitReason),
}

impl NodeState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, NodeState::Terminated(_))
    }
}

/// Answer to a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullReply {
    /// A batch of this size was pushed and accepted. Zero when the batch
    /// timeout fired with nothing buffered.
    Delivered { size: u64 },
    /// The producer will never deliver again.
    Exhausted,
}

/// Point-in-time view of a node, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub operator: String,
    pub state: NodeState,
    pub inbound_size: u64,
    pub outbound_size: u64,
    /// Generator steps taken so far.
    pub steps: u64,
    pub paused: bool,
    pub has_pull_request: bool,
}

pub(crate) enum NodeMessage {
    Start {
        previous: Vec<NodeHandle>,
        reply: oneshot::Sender<Result<()>>,
    },
    Push {
        batch: Batch,
        reply: oneshot::Sender<Result<()>>,
    },
    Pull {
        sink: SinkHandle,
        batch_size: u64,
        batch_timeout: Duration,
        reply: oneshot::Sender<Result<PullReply>>,
    },
    Pause,
    Resume,
    Shutdown {
        reason: ExitReason,
    },
    Inspect {
        reply: oneshot::Sender<NodeSnapshot>,
    },
}

pub(crate) type Mailbox = mpsc::UnboundedSender<NodeMessage>;

/// Address of an execution node.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    operator: Arc<str>,
    mailbox: Mailbox,
    state: watch::Receiver<NodeState>,
}

impl NodeHandle {
    pub(crate) fn new(
        id: NodeId,
        operator: &str,
        mailbox: Mailbox,
        state: watch::Receiver<NodeState>,
    ) -> Self {
        Self {
            id,
            operator: Arc::from(operator),
            mailbox,
            state,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    fn unreachable(&self) -> PipelineError {
        PipelineError::logic(format!(
            "execution node {} `{}` is not reachable",
            self.id, self.operator
        ))
    }

    /// Start this node. `previous` holds the upstream node for transforms
    /// and sinks and must be empty for sources. Resolves once the whole
    /// chain upstream of this node has started.
    pub async fn start(&self, previous: Vec<NodeHandle>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.forward_start(previous, reply)?;
        rx.await.map_err(|_| self.unreachable())?
    }

    pub(crate) fn forward_start(
        &self,
        previous: Vec<NodeHandle>,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.mailbox
            .send(NodeMessage::Start { previous, reply })
            .map_err(|_| self.unreachable())
    }

    /// Push a batch into this node's inbound buffer.
    pub async fn push(&self, batch: Batch) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(NodeMessage::Push { batch, reply })
            .map_err(|_| self.unreachable())?;
        rx.await.map_err(|_| self.unreachable())?
    }

    /// Register demand. Resolves once the batch was pushed to `sink` and
    /// acknowledged, or once the node is exhausted. A terminated node
    /// answers `Exhausted`; [`terminated`](Self::terminated) tells why.
    pub async fn pull(
        &self,
        sink: SinkHandle,
        batch_size: u64,
        batch_timeout: Duration,
    ) -> Result<PullReply> {
        let rx = self.send_pull(sink, batch_size, batch_timeout);
        rx.await.unwrap_or(Ok(PullReply::Exhausted))
    }

    pub(crate) fn send_pull(
        &self,
        sink: SinkHandle,
        batch_size: u64,
        batch_timeout: Duration,
    ) -> oneshot::Receiver<Result<PullReply>> {
        let (reply, rx) = oneshot::channel();
        let msg = NodeMessage::Pull {
            sink,
            batch_size,
            batch_timeout,
            reply,
        };
        if let Err(mpsc::error::SendError(msg)) = self.mailbox.send(msg) {
            // The mailbox closes only once the node stopped taking pulls.
            if let NodeMessage::Pull { reply, .. } = msg {
                let _ = reply.send(Ok(PullReply::Exhausted));
            }
        }
        rx
    }

    pub fn pause(&self) {
        let _ = self.mailbox.send(NodeMessage::Pause);
    }

    pub fn resume(&self) {
        let _ = self.mailbox.send(NodeMessage::Resume);
    }

    /// Ask the node to terminate. A node that already terminated ignores
    /// this.
    pub fn shutdown(&self, reason: ExitReason) {
        let _ = self.mailbox.send(NodeMessage::Shutdown { reason });
    }

    /// Inspect the node, or `None` once it terminated.
    pub async fn snapshot(&self) -> Option<NodeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(NodeMessage::Inspect { reply }).ok()?;
        rx.await.ok()
    }

    pub fn state(&self) -> NodeState {
        self.state.borrow().clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.state.clone()
    }

    /// Wait until the node terminated.
    pub async fn terminated(&self) -> ExitReason {
        let mut state = self.state.clone();
        loop {
            if let NodeState::Terminated(reason) = &*state.borrow_and_update() {
                return reason.clone();
            }
            if state.changed().await.is_err() {
                return match &*state.borrow() {
                    NodeState::Terminated(reason) => reason.clone(),
                    _ => ExitReason::Error(Diagnostic::error(format!(
                        "execution node {} `{}` vanished",
                        self.id, self.operator
                    ))),
                };
            }
        }
    }

    /// The address to pass along when this node pulls from its upstream.
    pub fn sink(&self) -> SinkHandle {
        SinkHandle {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeHandle({}, `{}`)", self.id, self.operator)
    }
}

/// Destination of pushes answering a pull.
#[derive(Clone)]
pub struct SinkHandle {
    mailbox: Mailbox,
}

impl SinkHandle {
    /// A sink that is not an execution node. Pushes arrive on the returned
    /// receiver.
    pub fn channel() -> (SinkHandle, SinkReceiver) {
        let (mailbox, rx) = mpsc::unbounded_channel();
        (SinkHandle { mailbox }, SinkReceiver { rx })
    }

    /// Deliver a batch; the returned receiver resolves with the sink's
    /// acknowledgement.
    pub(crate) fn push(&self, batch: Batch) -> Option<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(NodeMessage::Push { batch, reply }).ok()?;
        Some(rx)
    }
}

/// A push received by a [`SinkReceiver`], waiting to be acknowledged.
pub struct IncomingPush {
    batch: Batch,
    reply: oneshot::Sender<Result<()>>,
}

impl IncomingPush {
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Acknowledge the push and take the batch.
    pub fn accept(self) -> Batch {
        let _ = self.reply.send(Ok(()));
        self.batch
    }

    /// Refuse the push; the producer terminates with `error`.
    pub fn reject(self, error: PipelineError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Receiving end of [`SinkHandle::channel`].
pub struct SinkReceiver {
    rx: mpsc::UnboundedReceiver<NodeMessage>,
}

impl SinkReceiver {
    /// Next push, or `None` once every handle to this sink was dropped.
    pub async fn recv(&mut self) -> Option<IncomingPush> {
        while let Some(msg) = self.rx.recv().await {
            if let Some(push) = Self::as_push(msg) {
                return Some(push);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<IncomingPush> {
        while let Ok(msg) = self.rx.try_recv() {
            if let Some(push) = Self::as_push(msg) {
                return Some(push);
            }
        }
        None
    }

    fn as_push(msg: NodeMessage) -> Option<IncomingPush> {
        match msg {
            NodeMessage::Push { batch, reply } => Some(IncomingPush { batch, reply }),
            // Anything else addressed to a plain sink is ignored; dropping
            // the reply channel tells the sender nobody answered.
            _ => None,
        }
    }
}

/// Collect the table slices of a batch, failing on bytes.
pub fn batch_events(batch: Batch) -> Result<Vec<TableSlice>> {
    batch.into_events().ok_or_else(|| {
        PipelineError::TypeMismatch("expected events but received bytes".to_string())
    })
}
