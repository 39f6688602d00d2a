//! The `cache` operator: read from, write to, or pass through a named
//! cache.
//!
//! - `read` is a source emitting the cache's contents; it waits at the
//!   write frontier until the writer appends or finishes.
//! - `write` is a sink that becomes the cache's only writer.
//! - `readwrite` passes its input through while writing it to the cache. If
//!   another writer got there first it ignores its input and reads instead.

use crate::cache::{CacheManager, CacheOptions, CacheReader, CacheWriter, WriteOutcome};
use crate::data::TableSlice;
use crate::error::{PipelineError, Result};
use crate::pipeline::context::{OperatorControl, Request};
use crate::pipeline::element::{ElementType, Void};
use crate::pipeline::generator::{BoxGenerator, Generator, GeneratorExt, Step};
use crate::pipeline::operator::{
    Operator, OperatorConfig, OperatorInput, OperatorOutput, OptimizeResult,
};
use crate::pipeline::expression::{EventOrder, Expression};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Read,
    Write,
    #[default]
    ReadWrite,
}

fn default_capacity() -> u64 {
    4 * 1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    pub id: String,
    #[serde(default)]
    pub mode: CacheMode,
    /// Maximum number of cached events; excess input is not cached.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Inactivity lifetime; the engine's default applies when absent.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Absolute lifetime from creation.
    #[serde(default)]
    pub max_ttl_ms: Option<u64>,
}

impl Cache {
    pub fn new(id: impl Into<String>, mode: CacheMode) -> Self {
        Self {
            id: id.into(),
            mode,
            capacity: default_capacity(),
            ttl_ms: None,
            max_ttl_ms: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl_ms = Some(max_ttl.as_millis() as u64);
        self
    }

    fn options(&self, caches: &CacheManager) -> CacheOptions {
        let mut options = caches.default_options(self.capacity);
        if let Some(ttl) = self.ttl_ms {
            options.ttl = Duration::from_millis(ttl);
        }
        options.max_ttl = self.max_ttl_ms.map(Duration::from_millis);
        options
    }
}

enum Connection {
    Writer(CacheWriter),
    Reader(CacheReader),
}

async fn connect(caches: CacheManager, id: String, mode: CacheMode, options: CacheOptions) -> Result<Connection> {
    match mode {
        CacheMode::Read => Ok(Connection::Reader(caches.get(&id, false).await?.reader())),
        CacheMode::Write => {
            let cache = caches.create(&id, options, true).await?;
            Ok(Connection::Writer(cache.announce().await?))
        }
        CacheMode::ReadWrite => {
            let cache = caches.create(&id, options, false).await?;
            match cache.announce().await {
                Ok(writer) => Ok(Connection::Writer(writer)),
                Err(_) => Ok(Connection::Reader(cache.reader())),
            }
        }
    }
}

enum State {
    Connecting(Request<Result<Connection>>),
    Writing(CacheWriter),
    Reading {
        reader: CacheReader,
        pending: Option<Request<Option<TableSlice>>>,
    },
    Done,
}

struct CacheGenerator {
    id: String,
    ctrl: OperatorControl,
    input: Option<BoxGenerator<TableSlice>>,
    state: State,
}

impl Generator for CacheGenerator {
    type Item = TableSlice;

    fn next(&mut self) -> Result<Step<TableSlice>> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Connecting(mut request) => {
                let connection = match request.try_take() {
                    None => {
                        self.state = State::Connecting(request);
                        return Ok(Step::Pending);
                    }
                    Some(result) => result??,
                };
                self.state = match connection {
                    Connection::Writer(writer) => {
                        tracing::debug!("Writing to cache `{}` as {}", self.id, writer.id());
                        State::Writing(writer)
                    }
                    Connection::Reader(reader) => {
                        // Whatever we were fed is not ours to cache.
                        self.input = None;
                        State::Reading {
                            reader,
                            pending: None,
                        }
                    }
                };
                Ok(Step::Pending)
            }
            State::Writing(mut writer) => {
                let Some(input) = self.input.as_mut() else {
                    return Err(PipelineError::logic(format!(
                        "cache `{}` cannot be written without input",
                        self.id
                    )));
                };
                match input.next()? {
                    Step::Item(slice) => {
                        if slice.rows() > 0 {
                            self.report(writer.write(slice.clone()));
                        }
                        self.state = State::Writing(writer);
                        Ok(Step::Item(slice))
                    }
                    Step::Pending => {
                        self.state = State::Writing(writer);
                        Ok(Step::Pending)
                    }
                    Step::Done => {
                        writer.finish();
                        Ok(Step::Done)
                    }
                }
            }
            State::Reading { reader, pending } => {
                let mut request = pending.unwrap_or_else(|| self.ctrl.request(reader.read()));
                match request.try_take() {
                    None => {
                        self.state = State::Reading {
                            reader,
                            pending: Some(request),
                        };
                        Ok(Step::Pending)
                    }
                    Some(Ok(Some(slice))) => {
                        self.state = State::Reading {
                            reader,
                            pending: None,
                        };
                        Ok(Step::Item(slice))
                    }
                    Some(Ok(None)) => Ok(Step::Done),
                    Some(Err(err)) => Err(err),
                }
            }
            State::Done => Ok(Step::Done),
        }
    }
}

impl CacheGenerator {
    fn report(&self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Accepted => {}
            WriteOutcome::Truncated { capacity } => self.ctrl.warn(format!(
                "cache `{}` exceeded capacity of {} events",
                self.id, capacity
            )),
            WriteOutcome::OutOfMemory { limit } => self.ctrl.warn(format!(
                "cache `{}` exceeded the memory budget of {} bytes",
                self.id, limit
            )),
        }
    }
}

impl Operator for Cache {
    fn name(&self) -> &str {
        "cache"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        match (self.mode, input) {
            (CacheMode::Read, ElementType::Void) => Ok(ElementType::Events),
            (CacheMode::Write, ElementType::Events) => Ok(ElementType::Void),
            (CacheMode::ReadWrite, ElementType::Events) => Ok(ElementType::Events),
            (CacheMode::ReadWrite, ElementType::Void) => Ok(ElementType::Events),
            (mode, input) => Err(PipelineError::TypeMismatch(format!(
                "operator `cache` in {:?} mode does not accept {} input",
                mode, input
            ))),
        }
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let input = match input {
            OperatorInput::Void => None,
            other => Some(other.into_events(self.name())?),
        };
        // Without input there is nothing to write.
        let mode = match (self.mode, &input) {
            (CacheMode::ReadWrite, None) => CacheMode::Read,
            (mode, _) => mode,
        };
        let caches = ctrl.engine().caches().clone();
        let options = self.options(&caches);
        let request = ctrl.request(connect(caches, self.id.clone(), mode, options));
        let gen = CacheGenerator {
            id: self.id.clone(),
            ctrl: ctrl.clone(),
            input,
            state: State::Connecting(request),
        };
        Ok(match self.mode {
            CacheMode::Write => OperatorOutput::Void(gen.map_items(|_| Ok(Void)).boxed()),
            _ => OperatorOutput::Events(gen.boxed()),
        })
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn optimize(&self, _filter: &Expression, order: EventOrder) -> OptimizeResult {
        OptimizeResult::order_invariant(self, order)
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        OperatorConfig::from_args(self.name(), self)
    }
}
