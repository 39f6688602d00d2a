//! Sources: operators that produce data out of nothing.

use crate::data::{Chunk, DataType, Field, Schema, TableSlice, Value};
use crate::error::{PipelineError, Result};
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::ElementType;
use crate::pipeline::generator::{from_fn, from_iter, GeneratorExt, Step};
use crate::pipeline::operator::{
    expect_input, Operator, OperatorConfig, OperatorInput, OperatorOutput,
};
use chrono::Utc;
use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_batch_size() -> u64 {
    1024
}

/// Emits rows with a single increasing integer field `x`, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generate {
    /// Total rows; unbounded when absent.
    #[serde(default)]
    pub rows: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
}

impl Generate {
    pub fn finite(rows: u64, batch_size: u64) -> Self {
        Self {
            rows: Some(rows),
            batch_size,
        }
    }

    pub fn infinite(batch_size: u64) -> Self {
        Self {
            rows: None,
            batch_size,
        }
    }

    pub fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            "slipstream.generated",
            vec![Field::new("x", DataType::Int64)],
        ))
    }
}

impl Operator for Generate {
    fn name(&self) -> &str {
        "generate"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        if self.batch_size == 0 {
            return Err(PipelineError::Config(
                "`generate` needs a positive batch size".to_string(),
            ));
        }
        let schema = Self::schema();
        let batch_size = self.batch_size;
        let limit = self.rows;
        let mut next = 0u64;
        let gen = from_fn(move || {
            let remaining = limit.map_or(batch_size, |limit| limit.saturating_sub(next));
            if remaining == 0 {
                return Ok(Step::Done);
            }
            let rows = remaining.min(batch_size);
            let column = (next..next + rows).map(|i| Value::Int64(i as i64)).collect();
            let mut slice = TableSlice::new(Arc::clone(&schema), vec![column])?;
            slice.set_offset(next);
            slice.set_import_time(Utc::now());
            next += rows;
            Ok(Step::Item(slice))
        });
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        OperatorConfig::from_args(self.name(), self)
    }
}

/// Emits a fixed list of table slices.
#[derive(Debug, Clone)]
pub struct FromEvents {
    slices: Vec<TableSlice>,
}

impl FromEvents {
    pub fn new(slices: Vec<TableSlice>) -> Self {
        Self { slices }
    }
}

impl Operator for FromEvents {
    fn name(&self) -> &str {
        "from_events"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        Ok(OperatorOutput::Events(from_iter(self.slices.clone()).boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

/// Emits a fixed list of byte chunks.
#[derive(Debug, Clone)]
pub struct FromBytes {
    chunks: Vec<Chunk>,
}

impl FromBytes {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}

impl Operator for FromBytes {
    fn name(&self) -> &str {
        "from_bytes"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Bytes)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        Ok(OperatorOutput::Bytes(from_iter(self.chunks.clone()).boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

/// Emits table slices sent by another thread; exhausted once every sender
/// was dropped.
#[derive(Debug, Clone)]
pub struct ChannelSource {
    rx: Receiver<TableSlice>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<TableSlice>) -> Self {
        Self { rx }
    }
}

impl Operator for ChannelSource {
    fn name(&self) -> &str {
        "channel_source"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        let rx = self.rx.clone();
        let gen = from_fn(move || {
            Ok(match rx.try_recv() {
                Ok(slice) => Step::Item(slice),
                Err(TryRecvError::Empty) => Step::Pending,
                Err(TryRecvError::Disconnected) => Step::Done,
            })
        });
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}
