//! The `where` operator.

use crate::error::Result;
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::ElementType;
use crate::pipeline::expression::{EventOrder, Expression};
use crate::pipeline::generator::GeneratorExt;
use crate::pipeline::operator::{
    expect_input, Operator, OperatorConfig, OperatorInput, OperatorOutput, OptimizeResult,
};
use serde::{Deserialize, Serialize};

/// Keeps the rows matching an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
    pub expression: Expression,
}

impl Where {
    pub fn new(expression: Expression) -> Self {
        Self { expression }
    }
}

impl Operator for Where {
    fn name(&self) -> &str {
        "where"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let input = input.into_events(self.name())?;
        let expression = self.expression.clone();
        // Slices without matches become stubs, which the node drops.
        let gen = input.map_items(move |slice| Ok(expression.filter(&slice)));
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }

    /// A filter always moves upstream; the operator itself disappears.
    fn optimize(&self, filter: &Expression, order: EventOrder) -> OptimizeResult {
        OptimizeResult {
            filter: Some(self.expression.clone().and(filter.clone())),
            order,
            replacement: None,
        }
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        OperatorConfig::from_args(self.name(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::expression::CompareOp;

    #[test]
    fn test_optimize_absorbs_filter() {
        let op = Where::new(Expression::compare("x", CompareOp::Gt, 1i64));
        let result = op.optimize(&Expression::True, EventOrder::Schema);
        assert!(result.replacement.is_none());
        assert_eq!(result.order, EventOrder::Schema);
        assert_eq!(result.filter, Some(Expression::compare("x", CompareOp::Gt, 1i64)));
    }

    #[test]
    fn test_events_only() {
        let op = Where::new(Expression::True);
        assert!(op.infer_type(ElementType::Bytes).is_err());
        assert_eq!(op.infer_type(ElementType::Events).unwrap(), ElementType::Events);
    }
}
