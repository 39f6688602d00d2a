//! Integration tests for the `tcp_listen` operator
//!
//! Every test listens on an ephemeral local port and talks to it with plain
//! blocking sockets.

mod common;

use common::{engine_with_diagnostics, first_column, small_config, within};
use serial_test::serial;
use slipstream::config::EngineConfig;
use slipstream::pipeline::operators::{ReadLines, TcpListen};
use slipstream::pipeline::{OutputReader, Pipeline, PipelineExecutor, Severity};
use slipstream::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

fn config() -> EngineConfig {
    let mut config = small_config(1024, 256);
    config.demand.bytes.batch_timeout_ms = 20;
    config.demand.bytes.min_backoff_ms = 1;
    config.demand.bytes.max_backoff_ms = 20;
    config.tcp.read_timeout_ms = 20;
    config
}

fn listener(max_connections: usize) -> TcpListen {
    TcpListen::new("127.0.0.1:0", Pipeline::default().then(ReadLines))
        .with_max_connections(max_connections)
}

fn send(addr: SocketAddr, payload: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(payload.as_bytes()).unwrap();
    stream.flush().unwrap();
    stream
}

/// Read lines from the listener's output until `count` arrived.
async fn read_lines(output: &mut OutputReader, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    within(async {
        while lines.len() < count {
            let Some(batch) = output.next().await.unwrap() else {
                break;
            };
            let slices = batch.into_events().unwrap();
            lines.extend(first_column(&slices).into_iter().map(|value| match value {
                Value::String(line) => line,
                other => panic!("unexpected value {other:?}"),
            }));
        }
    })
    .await;
    lines
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_lines_from_one_connection() {
    let (engine, _diagnostics) = engine_with_diagnostics(config());
    let op = listener(8);
    let mut executor = PipelineExecutor::new(Pipeline::default().then(op.clone()), engine);
    within(executor.start()).await.unwrap();
    let addr = op.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    drop(send(addr, "alpha\nbeta\ngamma\n"));
    let mut output = executor.output().unwrap();
    assert_eq!(read_lines(&mut output, 3).await, ["alpha", "beta", "gamma"]);

    executor.shutdown();
    within(executor.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_lines_from_many_connections() {
    let (engine, _diagnostics) = engine_with_diagnostics(config());
    let op = listener(8);
    let mut executor = PipelineExecutor::new(Pipeline::default().then(op.clone()), engine);
    within(executor.start()).await.unwrap();
    let addr = op.local_addr().unwrap();

    let clients: Vec<_> = (0..3)
        .map(|i| send(addr, &format!("client {i} first\nclient {i} second\n")))
        .collect();
    drop(clients);

    let mut output = executor.output().unwrap();
    let mut lines = read_lines(&mut output, 6).await;
    lines.sort();
    let mut expected: Vec<String> = (0..3)
        .flat_map(|i| [format!("client {i} first"), format!("client {i} second")])
        .collect();
    expected.sort();
    assert_eq!(lines, expected);

    executor.shutdown();
    within(executor.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_connections_above_limit_are_refused() {
    let (engine, diagnostics) = engine_with_diagnostics(config());
    let op = listener(1);
    let mut executor = PipelineExecutor::new(Pipeline::default().then(op.clone()), engine);
    within(executor.start()).await.unwrap();
    let addr = op.local_addr().unwrap();
    let mut output = executor.output().unwrap();

    // Keep the first connection open and make sure it was accepted.
    let _first = send(addr, "held\n");
    assert_eq!(read_lines(&mut output, 1).await, ["held"]);

    let mut second = send(addr, "ignored\n");
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(second.read(&mut buf).unwrap_or(0), 0);

    within(async {
        loop {
            if diagnostics.try_iter().any(|diag| {
                diag.severity == Severity::Warning
                    && diag.message.starts_with("refusing connection from")
            }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    executor.shutdown();
    within(executor.wait()).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_endpoint_in_use_fails_start() {
    let (engine, _diagnostics) = engine_with_diagnostics(config());
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = taken.local_addr().unwrap().to_string();
    let op = TcpListen::new(endpoint.clone(), Pipeline::default().then(ReadLines));
    let mut executor = PipelineExecutor::new(Pipeline::default().then(op), engine);
    let err = within(executor.start()).await.unwrap_err();
    assert!(err
        .to_string()
        .contains(&format!("failed to listen on {endpoint}")));
}
