//! The `tcp_listen` operator: accept TCP connections and parse what they
//! send into events.
//!
//! # Architecture
//!
//! ```text
//! accept loop ──► connection 1: [socket reader | parser | forward] ─┐
//!             ──► connection 2: ...                                 ├─► bridge ─► tcp_listen output
//!             ──► connection N: ...                                 ┘
//! ```
//!
//! The listening socket is bound when the operator is instantiated, so a
//! bad endpoint fails the pipeline at start. Every accepted connection runs
//! its own pipeline whose socket reader is detached: it blocks in `read`
//! with a timeout so shutdown is noticed. All connections feed one bounded
//! bridge channel, which the operator's generator drains.

use crate::data::{Chunk, TableSlice};
use crate::error::{PipelineError, Result, ResultExt};
use crate::pipeline::chain::Pipeline;
use crate::pipeline::context::{EngineContext, OperatorControl};
use crate::pipeline::element::ElementType;
use crate::pipeline::executor::PipelineExecutor;
use crate::pipeline::generator::{from_fn, Generator, GeneratorExt, Step};
use crate::pipeline::operator::{
    expect_input, Location, Operator, OperatorConfig, OperatorInput, OperatorOutput,
};
use crate::pipeline::operators::sink::{ForwardSink, ProducerWakers};
use crate::pipeline::operators::ReadLines;
use crate::pipeline::registry::OperatorRegistry;
use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

fn default_max_connections() -> usize {
    128
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpListenArgs {
    endpoint: String,
    /// Defaults to `read_lines` when empty.
    #[serde(default)]
    parser: Vec<OperatorConfig>,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct TcpListen {
    endpoint: String,
    parser: Pipeline,
    max_connections: usize,
    bound: Arc<Mutex<Option<SocketAddr>>>,
}

impl TcpListen {
    /// Listen on `endpoint` (`host:port`), parsing every connection with
    /// `parser`, which must turn bytes into events.
    pub fn new(endpoint: impl Into<String>, parser: Pipeline) -> Self {
        Self {
            endpoint: endpoint.into(),
            parser,
            max_connections: default_max_connections(),
            bound: Arc::default(),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn from_config(config: &OperatorConfig, registry: &OperatorRegistry) -> Result<Box<dyn Operator>> {
        let args: TcpListenArgs = config.args()?;
        let parser = if args.parser.is_empty() {
            Pipeline::default().then(ReadLines)
        } else {
            registry.build_pipeline(&args.parser)?
        };
        Ok(Box::new(
            Self::new(args.endpoint, parser).with_max_connections(args.max_connections),
        ))
    }

    /// Address the operator listens on once instantiated. Useful with port
    /// 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_parser(&self) -> Result<()> {
        match self.parser.infer_type(ElementType::Bytes)? {
            ElementType::Events => Ok(()),
            other => Err(PipelineError::TypeMismatch(format!(
                "the parser of `tcp_listen` must turn bytes into events, not {}",
                other
            ))),
        }
    }
}

/// Reads a blocking socket into chunks. Runs detached.
#[derive(Debug, Clone)]
struct SocketReader {
    stream: Arc<Mutex<Option<TcpStream>>>,
    read_size: usize,
}

impl Operator for SocketReader {
    fn name(&self) -> &str {
        "tcp_read"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Bytes)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PipelineError::logic("socket was already handed to a reader"))?;
        let mut buf = vec![0u8; self.read_size.max(1)];
        let gen = from_fn(move || match stream.read(&mut buf) {
            Ok(0) => Ok(Step::Done),
            Ok(n) => Ok(Step::Item(Chunk::copy_from_slice(&buf[..n]))),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(Step::Pending)
            }
            Err(err) => Err(err.into()),
        });
        Ok(OperatorOutput::Bytes(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn location(&self) -> Location {
        Location::Local
    }

    fn detached(&self) -> bool {
        true
    }
}

struct Listener {
    bridge: Receiver<TableSlice>,
    connections: ProducerWakers,
    // Dropping this stops the accept loop and every connection.
    _cancel: oneshot::Sender<()>,
}

impl Generator for Listener {
    type Item = TableSlice;

    fn next(&mut self) -> Result<Step<TableSlice>> {
        Ok(match self.bridge.try_recv() {
            Ok(slice) => {
                self.connections.wake_all();
                Step::Item(slice)
            }
            Err(TryRecvError::Empty) => Step::Pending,
            Err(TryRecvError::Disconnected) => Step::Done,
        })
    }
}

struct AcceptLoop {
    endpoint: String,
    parser: Pipeline,
    max_connections: usize,
    bridge: ForwardSink,
    engine: EngineContext,
    ctrl: OperatorControl,
}

impl AcceptLoop {
    async fn run(self, listener: std::net::TcpListener, mut cancelled: oneshot::Receiver<()>) {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                self.ctrl.error(format!("failed to listen on {}: {}", self.endpoint, err));
                return;
            }
        };
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if connections.len() >= self.max_connections {
                            self.ctrl.warn(format!(
                                "refusing connection from {}: {} connections are active",
                                peer, self.max_connections
                            ));
                        } else {
                            tracing::debug!("Accepted connection from {} on {}", peer, self.endpoint);
                            connections.spawn(serve(
                                stream,
                                peer,
                                self.parser.clone(),
                                self.bridge.clone(),
                                self.engine.clone(),
                                self.ctrl.clone(),
                            ));
                        }
                    }
                    Err(err) => {
                        self.ctrl.error(format!("failed to accept on {}: {}", self.endpoint, err));
                        break;
                    }
                },
            }
        }
        tracing::debug!("Stopped listening on {}", self.endpoint);
        // Dropping the set aborts the remaining connections.
        connections.abort_all();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    parser: Pipeline,
    bridge: ForwardSink,
    engine: EngineContext,
    ctrl: OperatorControl,
) {
    match serve_connection(stream, parser, bridge, engine).await {
        Ok(()) => tracing::debug!("Connection from {} closed", peer),
        Err(err) => ctrl.warn(format!("connection from {} failed: {}", peer, err)),
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    parser: Pipeline,
    bridge: ForwardSink,
    engine: EngineContext,
) -> Result<()> {
    let settings = engine.config().tcp;
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(settings.read_timeout().max(Duration::from_millis(1))))?;
    let mut pipeline = parser;
    pipeline.prepend(Box::new(SocketReader {
        stream: Arc::new(Mutex::new(Some(stream))),
        read_size: settings.read_size,
    }));
    pipeline.push(Box::new(bridge));
    let mut executor = PipelineExecutor::new(pipeline, engine);
    executor.run().await
}

impl Operator for TcpListen {
    fn name(&self) -> &str {
        "tcp_listen"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)?;
        self.check_parser()?;
        Ok(ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        self.check_parser()?;
        if self.max_connections == 0 {
            return Err(PipelineError::Config(
                "`tcp_listen` needs to allow at least one connection".to_string(),
            ));
        }
        let listener = std::net::TcpListener::bind(&self.endpoint)
            .with_context(|| format!("failed to listen on {}", self.endpoint))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        tracing::info!("Listening on {}", addr);

        let (tx, rx) = crossbeam_channel::bounded(ctrl.config().tcp.bridge_capacity.max(1));
        let connections = ProducerWakers::default();
        let (cancel, cancelled) = oneshot::channel();
        let accept = AcceptLoop {
            endpoint: addr.to_string(),
            parser: self.parser.clone(),
            max_connections: self.max_connections,
            bridge: ForwardSink {
                tx,
                producers: connections.clone(),
                consumer: ctrl.waker(),
            },
            engine: ctrl.engine().clone(),
            ctrl: ctrl.clone(),
        };
        ctrl.spawn(accept.run(listener, cancelled));
        Ok(OperatorOutput::Events(
            Listener {
                bridge: rx,
                connections,
                _cancel: cancel,
            }
            .boxed(),
        ))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn location(&self) -> Location {
        Location::Local
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        let parser = self
            .parser
            .operators()
            .iter()
            .map(|op| op.to_config())
            .collect::<Result<Vec<_>>>()?;
        OperatorConfig::from_args(
            self.name(),
            &TcpListenArgs {
                endpoint: self.endpoint.clone(),
                parser,
                max_connections: self.max_connections,
            },
        )
    }
}
