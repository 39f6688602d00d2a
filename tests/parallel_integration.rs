//! Integration tests for the `parallel` operator

mod common;

use common::builders::numbered_batches;
use common::operators::FailAfter;
use common::{collect, engine, first_column, total_rows, within};
use slipstream::pipeline::operators::{ChannelSink, FromEvents, Generate, Head, Parallel, Where};
use slipstream::pipeline::{CompareOp, ElementType, Expression, Pipeline, PipelineExecutor};
use slipstream::{PipelineError, TableSlice, Value};

fn sorted_ints(slices: &[TableSlice]) -> Vec<i64> {
    let mut values: Vec<i64> = first_column(slices)
        .into_iter()
        .map(|value| match value {
            Value::Int64(v) => v,
            other => panic!("unexpected value {other:?}"),
        })
        .collect();
    values.sort_unstable();
    values
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_filter_keeps_every_match() {
    let workers = Pipeline::default().then(Where::new(Expression::compare(
        "x",
        CompareOp::Ge,
        10_000i64,
    )));
    let pipeline = Pipeline::default()
        .then(Generate::finite(20_000, 20_000))
        .then(Parallel::new(4, workers));
    let mut executor = PipelineExecutor::new(pipeline, engine());
    within(executor.start()).await.unwrap();
    assert_eq!(executor.output_type(), ElementType::Events);

    let slices = within(collect(&mut executor.output().unwrap()))
        .await
        .unwrap();
    assert_eq!(sorted_ints(&slices), (10_000..20_000).collect::<Vec<_>>());
    within(executor.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sink_workers() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let pipeline = Pipeline::default()
        .then(FromEvents::new(numbered_batches(20, 250)))
        .then(Parallel::new(3, Pipeline::default().then(ChannelSink::new(tx))));
    let mut executor = PipelineExecutor::new(pipeline, engine());
    within(executor.run()).await.unwrap();
    assert_eq!(executor.output_type(), ElementType::Void);

    let slices: Vec<TableSlice> = rx.try_iter().collect();
    assert_eq!(sorted_ints(&slices), (0..5000).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_failure_fails_parallel() {
    let pipeline = Pipeline::default()
        .then(FromEvents::new(numbered_batches(10, 100)))
        .then(Parallel::new(2, Pipeline::default().then(FailAfter { items: 1 })));
    let mut executor = PipelineExecutor::new(pipeline, engine());
    within(executor.start()).await.unwrap();
    let mut output = executor.output().unwrap();
    let _ = within(collect(&mut output)).await;

    match within(executor.wait()).await.unwrap_err() {
        PipelineError::NodeFailed {
            operator, reason, ..
        } => {
            assert_eq!(operator, "parallel");
            assert!(reason.message.contains("parallel worker #"));
            assert!(reason.message.contains("simulated failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_finishing_early_end_the_stream() {
    let pipeline = Pipeline::default()
        .then(Generate::infinite(1000))
        .then(Parallel::new(2, Pipeline::default().then(Head::new(10))));
    let mut executor = PipelineExecutor::new(pipeline, engine());
    within(executor.start()).await.unwrap();
    let slices = within(collect(&mut executor.output().unwrap()))
        .await
        .unwrap();
    assert_eq!(total_rows(&slices), 20);
    within(executor.wait()).await.unwrap();
}

#[tokio::test]
async fn test_zero_jobs_fail_to_start() {
    let pipeline = Pipeline::default()
        .then(Generate::finite(10, 10))
        .then(Parallel::new(0, Pipeline::default().then(Head::new(1))));
    let mut executor = PipelineExecutor::new(pipeline, engine());
    let err = within(executor.start()).await.unwrap_err();
    assert!(err.to_string().contains("failed to instantiate `parallel`"));
    assert!(err.to_string().contains("at least one job"));
}
