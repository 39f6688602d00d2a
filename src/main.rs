//! Slipstream - Main Entry Point
//!
//! Runs the pipeline defined in the engine configuration, or a small demo
//! pipeline when none is configured, and reports what came out of it.

use anyhow::Context;
use slipstream::{
    config::{EngineConfig, LogSettings},
    pipeline::{
        operators::{Generate, Where},
        ChannelHandler, CompareOp, EngineContext, Expression, OperatorRegistry, Pipeline,
        PipelineExecutor, Severity,
    },
};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load_or_default();
    let _guard = init_logging(&config.log);

    tracing::info!("Starting slipstream");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("slipstream-worker")
        .build()
        .context("failed to build the tokio runtime")?;
    let result = runtime.block_on(run(config));

    tracing::info!("Shutting down");
    result
}

/// Log to stderr and, if a log directory is configured, to a daily rotated
/// file. The returned guard flushes the file writer when dropped.
fn init_logging(settings: &LogSettings) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));
    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "slipstream.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn demo_pipeline() -> Pipeline {
    Pipeline::default()
        .then(Generate::finite(100_000, 1000))
        .then(Where::new(Expression::compare("x", CompareOp::Gt, 100i64)))
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let pipeline = if config.pipeline.is_empty() {
        tracing::info!("No pipeline configured, running the demo pipeline");
        demo_pipeline()
    } else {
        OperatorRegistry::with_builtins()
            .build_pipeline(&config.pipeline)
            .context("invalid pipeline in configuration")?
    };

    let (handler, diagnostics) = ChannelHandler::new();
    let engine = EngineContext::new(config)?.with_diagnostics(Arc::new(handler));
    let mut executor = PipelineExecutor::new(pipeline, engine);
    executor.start().await?;

    if let Some(mut output) = executor.output() {
        let mut batches = 0u64;
        let mut size = 0u64;
        while let Some(batch) = output.next().await? {
            batches += 1;
            size += batch.size();
        }
        tracing::info!(
            "Pipeline produced {} {} in {} batches",
            size,
            executor.output_type(),
            batches
        );
    }
    let result = executor.wait().await;

    let warnings = diagnostics
        .try_iter()
        .filter(|diag| diag.severity >= Severity::Warning)
        .count();
    if warnings > 0 {
        tracing::warn!("Pipeline reported {} warnings or errors", warnings);
    }
    result.context("pipeline failed")
}
