//! Streaming pipeline engine.
//!
//! A pipeline is an ordered list of operators. Executing it spawns one
//! execution node per operator; adjacent nodes exchange batches through a
//! pull/push protocol so that a slow consumer throttles everything upstream.
//!
//! # Architecture
//!
//! ```text
//!            pull(n)              pull(n)              pull(n)
//! [source] ◄────────── [transform] ◄────────── [sink] ◄──── executor: start()
//!          ──────────►             ──────────►
//!           push(batch)          push(batch)
//! ```
//!
//! # Design
//!
//! - **Generators**: operators are lazy, single-consumer step machines
//!   ([`Generator`]) that distinguish a value, "nothing yet" and exhaustion.
//! - **One task per node**: every [`NodeHandle`] addresses a tokio task that
//!   owns all of its node's state; peers only exchange messages.
//! - **Demand-driven**: a node requests from upstream only what fits into
//!   its inbound buffer and delivers at most what was requested.
//! - **Typed edges**: the element type of every edge is checked before any
//!   node is spawned.

pub mod bridge;
pub(crate) mod buffer;
pub mod chain;
pub mod context;
pub mod diagnostic;
pub mod element;
pub mod executor;
pub mod expression;
pub mod generator;
pub mod id;
pub mod node;
pub mod operator;
pub mod operators;
pub mod registry;

pub use bridge::{
    batch_events, ExitReason, IncomingPush, NodeHandle, NodeSnapshot, NodeState, PullReply,
    SinkHandle, SinkReceiver,
};
pub use chain::Pipeline;
pub use context::{EngineContext, NodeWaker, OperatorControl, Request};
pub use diagnostic::{ChannelHandler, Diagnostic, DiagnosticHandler, LoggingHandler, Severity};
pub use element::{Batch, Element, ElementType, Void};
pub use executor::{OutputReader, PipelineExecutor};
pub use expression::{CompareOp, EventOrder, Expression};
pub use generator::{BoxGenerator, Generator, GeneratorExt, Step};
pub use id::{NodeId, ReaderId, WriterId};
pub use node::spawn_exec_node;
pub use operator::{Location, Operator, OperatorConfig, OperatorInput, OperatorOutput, OptimizeResult};
pub use registry::{OperatorFactory, OperatorRegistry};
