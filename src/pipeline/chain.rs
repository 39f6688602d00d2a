//! Linear chains of operators.
//!
//! A [`Pipeline`] is itself an [`Operator`]: nested pipelines are flattened
//! on insertion, and a pipeline instantiated inside a single execution node
//! chains its operators' generators directly.
//!
//! # Optimization
//!
//! [`Operator::optimize`] on a pipeline walks the operators from last to
//! first, offering each the filter and ordering accumulated so far. An
//! operator that absorbs the filter passes a (possibly stronger) filter on
//! to its predecessor; one that does not gets a `where` inserted after it.

use crate::error::{PipelineError, Result};
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::ElementType;
use crate::pipeline::expression::{EventOrder, Expression};
use crate::pipeline::generator::{empty, GeneratorExt};
use crate::pipeline::operator::{
    Location, Operator, OperatorConfig, OperatorInput, OperatorOutput, OptimizeResult,
};
use crate::pipeline::operators::Where;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    operators: Vec<Box<dyn Operator>>,
}

impl Pipeline {
    pub fn new(operators: Vec<Box<dyn Operator>>) -> Self {
        let mut pipeline = Self::default();
        for op in operators {
            pipeline.push(op);
        }
        pipeline
    }

    /// Append an operator, flattening nested pipelines.
    pub fn push(&mut self, op: Box<dyn Operator>) {
        match op.as_pipeline() {
            Some(inner) => self.operators.extend(inner.operators.iter().cloned()),
            None => self.operators.push(op),
        }
    }

    /// Insert an operator at the front, flattening nested pipelines.
    pub fn prepend(&mut self, op: Box<dyn Operator>) {
        let ops = match op.as_pipeline() {
            Some(inner) => inner.operators.clone(),
            None => vec![op],
        };
        self.operators.splice(0..0, ops);
    }

    /// Builder-style [`Pipeline::push`].
    pub fn then(mut self, op: impl Operator + 'static) -> Self {
        self.push(Box::new(op));
        self
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub fn into_operators(self) -> Vec<Box<dyn Operator>> {
        self.operators
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Check the chain of element types, starting from `input`.
    pub fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        self.operators
            .iter()
            .enumerate()
            .try_fold(input, |current, (index, op)| {
                op.infer_type(current).map_err(|e| {
                    e.with_context(format!("operator #{} `{}` in pipeline", index, op.name()))
                })
            })
    }

    /// A closed pipeline starts with a source and ends with a sink.
    pub fn is_closed(&self) -> bool {
        matches!(self.infer_type(ElementType::Void), Ok(ElementType::Void))
    }

    /// Optimize a closed pipeline; any other pipeline is returned as is.
    pub fn optimize_if_closed(self) -> Pipeline {
        if !self.is_closed() {
            return self;
        }
        let result = Operator::optimize(&self, &Expression::True, EventOrder::Ordered);
        let mut optimized = Pipeline::default();
        if let Some(replacement) = result.replacement {
            optimized.push(replacement);
        }
        if let Some(filter) = result.filter.filter(|f| !f.is_trivially_true()) {
            optimized.prepend(Box::new(Where::new(filter)));
        }
        if optimized.is_closed() {
            optimized
        } else {
            tracing::error!("Optimization produced an ill-typed pipeline; running it unoptimized");
            self
        }
    }
}

impl Operator for Pipeline {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        Pipeline::infer_type(self, input)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let mut operators = self.operators.iter();
        let Some(first) = operators.next() else {
            return Ok(passthrough(input));
        };
        let mut output = first.instantiate(input, ctrl)?;
        for op in operators {
            output = op.instantiate(output.into_input(), ctrl)?;
        }
        Ok(output)
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    fn optimize(&self, filter: &Expression, order: EventOrder) -> OptimizeResult {
        let mut current_filter = filter.clone();
        let mut current_order = order;
        let mut reversed: Vec<Box<dyn Operator>> = Vec::with_capacity(self.operators.len());
        for op in self.operators.iter().rev() {
            let result = op.optimize(&current_filter, current_order);
            match result.filter {
                Some(filter) => current_filter = filter,
                None => {
                    if !current_filter.is_trivially_true() {
                        reversed.push(Box::new(Where::new(current_filter)));
                    }
                    current_filter = Expression::True;
                }
            }
            current_order = result.order;
            if let Some(replacement) = result.replacement {
                match replacement.as_pipeline() {
                    Some(inner) => reversed.extend(inner.operators.iter().rev().cloned()),
                    None => reversed.push(replacement),
                }
            }
        }
        reversed.reverse();
        OptimizeResult {
            filter: Some(current_filter),
            order: current_order,
            replacement: Some(Box::new(Pipeline {
                operators: reversed,
            })),
        }
    }

    fn location(&self) -> Location {
        if self.operators.iter().any(|op| op.location() == Location::Local) {
            Location::Local
        } else {
            Location::Remote
        }
    }

    fn detached(&self) -> bool {
        self.operators.iter().any(|op| op.detached())
    }

    fn idle_after(&self) -> Duration {
        self.operators
            .iter()
            .map(|op| op.idle_after())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        let operators = self
            .operators
            .iter()
            .map(|op| op.to_config())
            .collect::<Result<Vec<_>>>()?;
        OperatorConfig::from_args("pipeline", &operators)
    }

    fn as_pipeline(&self) -> Option<&Pipeline> {
        Some(self)
    }
}

fn passthrough(input: OperatorInput) -> OperatorOutput {
    match input {
        OperatorInput::Void => OperatorOutput::Void(empty().boxed()),
        OperatorInput::Bytes(gen) => OperatorOutput::Bytes(gen),
        OperatorInput::Events(gen) => OperatorOutput::Events(gen),
    }
}

impl TryFrom<Vec<OperatorConfig>> for Pipeline {
    type Error = PipelineError;

    fn try_from(configs: Vec<OperatorConfig>) -> Result<Self> {
        crate::pipeline::registry::OperatorRegistry::with_builtins().build_pipeline(&configs)
    }
}
