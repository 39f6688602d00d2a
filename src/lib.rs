//! # Slipstream: a demand-driven streaming pipeline engine
//!
//! Slipstream executes pipelines of operators over streams of table slices
//! (columnar batches of events) and byte chunks. Each operator runs in its
//! own execution node; nodes pull from their upstream and push to their
//! downstream, so buffer occupancy, not producer speed, decides how much
//! data is in flight.
//!
//! ## Architecture
//!
//! - **Pipeline**: operators, their type chain and the optimizer ([`pipeline::Pipeline`])
//! - **Execution**: one tokio task per node, a supervising [`pipeline::PipelineExecutor`]
//! - **Caches**: named, shared append-only caches ([`cache::CacheManager`])
//! - **Communication**: tokio channels between nodes, crossbeam channels to
//!   and from synchronous code
//!
//! ## Configuration
//!
//! Engine settings are read from TOML, by default from the platform config
//! directory:
//!
//! - **Linux**: `~/.config/slipstream/config.toml`
//! - **macOS**: `~/Library/Application Support/slipstream/config.toml`
//! - **Windows**: `%APPDATA%\slipstream\config.toml`
//!
//! ## Example
//!
//! ```no_run
//! use slipstream::{
//!     config::EngineConfig,
//!     pipeline::{operators, CompareOp, EngineContext, Expression, Pipeline, PipelineExecutor},
//! };
//!
//! # async fn run() -> slipstream::Result<()> {
//! let engine = EngineContext::new(EngineConfig::default())?;
//! let pipeline = Pipeline::default()
//!     .then(operators::Generate::finite(1000, 100))
//!     .then(operators::Where::new(Expression::compare("x", CompareOp::Gt, 100i64)))
//!     .then(operators::Discard);
//! PipelineExecutor::new(pipeline, engine).run().await
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;

// Re-export commonly used types
pub use config::EngineConfig;
pub use data::{Chunk, DataType, Field, Schema, TableSlice, Value};
pub use error::{PipelineError, Result, ResultExt};
pub use pipeline::{EngineContext, Operator, Pipeline, PipelineExecutor};
