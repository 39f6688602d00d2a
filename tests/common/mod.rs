//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod operators;

use slipstream::config::{DemandSettings, EngineConfig};
use slipstream::pipeline::{
    Batch, ChannelHandler, Diagnostic, EngineContext, NodeHandle, OutputReader, PullReply,
    SinkHandle,
};
use slipstream::{Result, TableSlice, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Fail the test instead of hanging when `fut` does not complete in time
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(test_timeout(), fut)
        .await
        .expect("test timed out")
}

/// Event demand with small, easily observable bounds
pub fn small_demand(max_buffered: u64, max_batch_size: u64) -> DemandSettings {
    DemandSettings {
        min_batch_size: 1,
        max_batch_size,
        max_buffered,
        batch_timeout_ms: 50,
        min_backoff_ms: 1,
        max_backoff_ms: 20,
        ..DemandSettings::events()
    }
}

/// Engine configuration with small event buffers
pub fn small_config(max_buffered: u64, max_batch_size: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.demand.events = small_demand(max_buffered, max_batch_size);
    config
}

pub fn engine() -> EngineContext {
    EngineContext::new(EngineConfig::default()).expect("tokio runtime")
}

/// Engine whose diagnostics are also sent to the returned receiver
pub fn engine_with_diagnostics(
    config: EngineConfig,
) -> (EngineContext, crossbeam_channel::Receiver<Diagnostic>) {
    let (handler, rx) = ChannelHandler::new();
    let engine = EngineContext::new(config)
        .expect("tokio runtime")
        .with_diagnostics(Arc::new(handler));
    (engine, rx)
}

/// Issue one pull and accept whatever is pushed in response
pub async fn pull_once(
    node: &NodeHandle,
    batch_size: u64,
    batch_timeout: Duration,
) -> Result<(Option<Batch>, PullReply)> {
    let (sink, mut incoming) = SinkHandle::channel();
    let pull = node.pull(sink, batch_size, batch_timeout);
    tokio::pin!(pull);
    tokio::select! {
        push = incoming.recv() => {
            let batch = push.map(|push| push.accept());
            let reply = pull.await?;
            Ok((batch, reply))
        }
        reply = &mut pull => Ok((None, reply?)),
    }
}

/// Read everything from an output reader
pub async fn collect(reader: &mut OutputReader) -> Result<Vec<TableSlice>> {
    let mut slices = Vec::new();
    while let Some(batch) = reader.next().await? {
        slices.extend(batch.into_events().expect("events output"));
    }
    Ok(slices)
}

/// All values of the first column, in order
pub fn first_column(slices: &[TableSlice]) -> Vec<Value> {
    slices
        .iter()
        .flat_map(|slice| slice.column(0).unwrap_or_default().to_vec())
        .collect()
}

pub fn total_rows(slices: &[TableSlice]) -> u64 {
    slices.iter().map(TableSlice::rows).sum()
}
