//! The operator contract.
//!
//! An operator is immutable configuration plus a typed input→output
//! mapping. At run time its execution node calls [`Operator::instantiate`]
//! exactly once with the upstream generator (or nothing, for sources) and
//! drives the returned generator.
//!
//! Input and output types come from the closed set in
//! [`ElementType`]: a source takes `void`, a sink returns `void`, and
//! everything else is a transform.

use crate::config::DemandOverrides;
use crate::data::{Chunk, TableSlice};
use crate::error::{PipelineError, Result};
use crate::pipeline::chain::Pipeline;
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::{ElementType, Void};
use crate::pipeline::expression::{EventOrder, Expression};
use crate::pipeline::generator::BoxGenerator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where an operator may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Must run in the caller's process: touches local files, sockets or
    /// processes.
    Local,
    /// May run wherever the orchestration decides.
    #[default]
    Remote,
}

/// The upstream generator handed to `instantiate`.
pub enum OperatorInput {
    Void,
    Bytes(BoxGenerator<Chunk>),
    Events(BoxGenerator<TableSlice>),
}

impl OperatorInput {
    pub fn element_type(&self) -> ElementType {
        match self {
            OperatorInput::Void => ElementType::Void,
            OperatorInput::Bytes(_) => ElementType::Bytes,
            OperatorInput::Events(_) => ElementType::Events,
        }
    }

    pub fn into_events(self, operator: &str) -> Result<BoxGenerator<TableSlice>> {
        match self {
            OperatorInput::Events(gen) => Ok(gen),
            other => Err(unexpected_input(operator, ElementType::Events, other.element_type())),
        }
    }

    pub fn into_bytes(self, operator: &str) -> Result<BoxGenerator<Chunk>> {
        match self {
            OperatorInput::Bytes(gen) => Ok(gen),
            other => Err(unexpected_input(operator, ElementType::Bytes, other.element_type())),
        }
    }

    pub fn expect_void(self, operator: &str) -> Result<()> {
        match self {
            OperatorInput::Void => Ok(()),
            other => Err(unexpected_input(operator, ElementType::Void, other.element_type())),
        }
    }
}

impl fmt::Debug for OperatorInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorInput({})", self.element_type())
    }
}

/// The generator returned by `instantiate`.
pub enum OperatorOutput {
    Void(BoxGenerator<Void>),
    Bytes(BoxGenerator<Chunk>),
    Events(BoxGenerator<TableSlice>),
}

impl OperatorOutput {
    pub fn element_type(&self) -> ElementType {
        match self {
            OperatorOutput::Void(_) => ElementType::Void,
            OperatorOutput::Bytes(_) => ElementType::Bytes,
            OperatorOutput::Events(_) => ElementType::Events,
        }
    }

    /// Reinterpret this output as the input of the next operator.
    /// A void output has nothing to hand on.
    pub fn into_input(self) -> OperatorInput {
        match self {
            OperatorOutput::Void(_) => OperatorInput::Void,
            OperatorOutput::Bytes(gen) => OperatorInput::Bytes(gen),
            OperatorOutput::Events(gen) => OperatorInput::Events(gen),
        }
    }
}

impl fmt::Debug for OperatorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorOutput({})", self.element_type())
    }
}

/// Result of pushing a filter and an ordering requirement into an operator.
#[derive(Debug)]
pub struct OptimizeResult {
    /// Filter the operator's input must satisfy, or `None` if the operator
    /// cannot pass the filter upstream and it must be applied after it.
    pub filter: Option<Expression>,
    /// Ordering the operator requires from its input.
    pub order: EventOrder,
    /// Operator to use instead, or `None` if it became a no-op.
    pub replacement: Option<Box<dyn Operator>>,
}

impl OptimizeResult {
    /// Keep the operator as is and stop pushdown at it.
    pub fn do_not_optimize(op: &dyn Operator) -> Self {
        Self {
            filter: None,
            order: EventOrder::Ordered,
            replacement: Some(op.copy()),
        }
    }

    /// Keep the operator; it does not care about the order of its input.
    pub fn order_invariant(op: &dyn Operator, order: EventOrder) -> Self {
        Self {
            filter: None,
            order,
            replacement: Some(op.copy()),
        }
    }
}

/// Serialized form of an operator, used to ship pipeline definitions
/// across process boundaries and to load them from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl OperatorConfig {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Build from typed arguments.
    pub fn from_args<A: Serialize>(name: impl Into<String>, args: &A) -> Result<Self> {
        Ok(Self::new(name, serde_json::to_value(args)?))
    }

    /// Decode typed arguments.
    pub fn args<A: for<'de> Deserialize<'de>>(&self) -> Result<A> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            PipelineError::Serialization(format!("invalid arguments for `{}`: {}", self.name, e))
        })
    }
}

/// A pluggable pipeline stage.
pub trait Operator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Output type for the given input type, or a type mismatch.
    fn infer_type(&self, input: ElementType) -> Result<ElementType>;

    /// Create the operator's generator from its input.
    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput>;

    /// Independent copy of this operator's configuration.
    fn copy(&self) -> Box<dyn Operator>;

    /// Absorb a downstream filter and ordering requirement. The default
    /// keeps the operator and stops pushdown here.
    fn optimize(&self, _filter: &Expression, _order: EventOrder) -> OptimizeResult {
        OptimizeResult {
            filter: None,
            order: EventOrder::Ordered,
            replacement: Some(self.copy()),
        }
    }

    fn location(&self) -> Location {
        Location::Remote
    }

    /// Whether the generator may block and needs a dedicated thread.
    fn detached(&self) -> bool {
        false
    }

    /// Minimum delay before a stalled generator is polled again.
    fn idle_after(&self) -> Duration {
        Duration::ZERO
    }

    fn demand(&self) -> DemandOverrides {
        DemandOverrides::default()
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        Err(PipelineError::Serialization(format!(
            "operator `{}` cannot be serialized",
            self.name()
        )))
    }

    /// Downcast hook used to flatten nested pipelines.
    fn as_pipeline(&self) -> Option<&Pipeline> {
        None
    }
}

impl Clone for Box<dyn Operator> {
    fn clone(&self) -> Self {
        self.copy()
    }
}

/// Check that `input` is the type an operator accepts and return its output.
pub fn expect_input(
    operator: &str,
    input: ElementType,
    accepted: ElementType,
    output: ElementType,
) -> Result<ElementType> {
    if input == accepted {
        Ok(output)
    } else {
        Err(unexpected_input(operator, accepted, input))
    }
}

fn unexpected_input(operator: &str, expected: ElementType, actual: ElementType) -> PipelineError {
    PipelineError::TypeMismatch(format!(
        "operator `{}` expects {} input but got {}",
        operator, expected, actual
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_input() {
        assert_eq!(
            expect_input("x", ElementType::Events, ElementType::Events, ElementType::Void).unwrap(),
            ElementType::Void
        );
        let err = expect_input("x", ElementType::Bytes, ElementType::Events, ElementType::Void)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch: operator `x` expects events input but got bytes"
        );
    }

    #[test]
    fn test_operator_config_args() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Args {
            limit: u64,
        }
        let config = OperatorConfig::from_args("head", &Args { limit: 3 }).unwrap();
        assert_eq!(config.args::<Args>().unwrap(), Args { limit: 3 });
        assert!(config.args::<Vec<String>>().is_err());
    }

    #[test]
    fn test_operator_config_default_args() {
        let config: OperatorConfig = serde_json::from_str(r#"{"name":"discard"}"#).unwrap();
        assert_eq!(config.args, serde_json::json!({}));
    }
}
