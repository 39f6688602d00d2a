//! The `head` operator.

use crate::error::Result;
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::ElementType;
use crate::pipeline::generator::{from_fn, Generator, GeneratorExt, Step};
use crate::pipeline::operator::{
    expect_input, Operator, OperatorConfig, OperatorInput, OperatorOutput,
};
use serde::{Deserialize, Serialize};

/// Passes the first `limit` rows, then completes without waiting for the
/// rest of its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Head {
    pub limit: u64,
}

impl Head {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl Operator for Head {
    fn name(&self) -> &str {
        "head"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let mut input = input.into_events(self.name())?;
        let mut remaining = self.limit;
        let gen = from_fn(move || {
            if remaining == 0 {
                return Ok(Step::Done);
            }
            Ok(input.next()?.map(|slice| {
                let slice = slice.subslice(0, remaining);
                remaining -= slice.rows();
                slice
            }))
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
