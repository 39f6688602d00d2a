//! Row predicates and event-order requirements used for pushdown.

use crate::data::{TableSlice, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// A boolean predicate over the fields of one row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    #[default]
    True,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Expression::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_trivially_true(&self) -> bool {
        match self {
            Expression::True => true,
            Expression::And(terms) => terms.iter().all(Expression::is_trivially_true),
            _ => false,
        }
    }

    /// Conjunction that drops trivially true operands.
    pub fn and(self, other: Expression) -> Expression {
        match (self.is_trivially_true(), other.is_trivially_true()) {
            (true, true) => Expression::True,
            (true, false) => other,
            (false, true) => self,
            (false, false) => {
                let mut terms = Vec::new();
                for expr in [self, other] {
                    match expr {
                        Expression::And(inner) => terms.extend(inner),
                        expr => terms.push(expr),
                    }
                }
                Expression::And(terms)
            }
        }
    }

    /// Evaluate against row `row` of `slice`. Missing fields and
    /// incomparable values evaluate to false.
    pub fn matches(&self, slice: &TableSlice, row: usize) -> bool {
        match self {
            Expression::True => true,
            Expression::Compare { field, op, value } => {
                let Some(column) = slice.schema().field_index(field) else {
                    return false;
                };
                slice
                    .value(row, column)
                    .and_then(|v| v.compare(value))
                    .is_some_and(|ordering| op.holds(ordering))
            }
            Expression::And(terms) => terms.iter().all(|t| t.matches(slice, row)),
            Expression::Or(terms) => terms.iter().any(|t| t.matches(slice, row)),
            Expression::Not(inner) => !inner.matches(slice, row),
        }
    }

    /// Keep the rows of `slice` that match.
    pub fn filter(&self, slice: &TableSlice) -> TableSlice {
        if self.is_trivially_true() {
            return slice.clone();
        }
        slice.filter_rows(|row| self.matches(slice, row))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::True => write!(f, "true"),
            Expression::Compare { field, op, value } => write!(f, "{} {} {}", field, op, value),
            Expression::And(terms) | Expression::Or(terms) => {
                let sep = if matches!(self, Expression::And(_)) {
                    " and "
                } else {
                    " or "
                };
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "({})", term)?;
                }
                Ok(())
            }
            Expression::Not(inner) => write!(f, "not ({})", inner),
        }
    }
}

/// Ordering guarantee a downstream consumer requires from its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrder {
    /// Events must stay in their original order.
    Ordered,
    /// Only the order among events of the same schema matters.
    Schema,
    /// No ordering is required.
    Unordered,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field, Schema, TableSliceBuilder};
    use std::sync::Arc;

    fn slice() -> TableSlice {
        let schema = Arc::new(Schema::new(
            "s",
            vec![
                Field::new("x", DataType::Int64),
                Field::new("name", DataType::String),
            ],
        ));
        let mut builder = TableSliceBuilder::new(schema);
        for i in 0..10 {
            builder
                .push_row(vec![Value::Int64(i), Value::String(format!("n{}", i))])
                .unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_compare_filter() {
        let expr = Expression::compare("x", CompareOp::Gt, 6i64);
        let out = expr.filter(&slice());
        assert_eq!(out.rows(), 3);
        assert_eq!(out.value(0, 0), Some(&Value::Int64(7)));
    }

    #[test]
    fn test_missing_field_is_false() {
        let expr = Expression::compare("nope", CompareOp::Eq, 1i64);
        assert_eq!(expr.filter(&slice()).rows(), 0);
    }

    #[test]
    fn test_and_simplifies_true() {
        let a = Expression::compare("x", CompareOp::Lt, 3i64);
        assert_eq!(Expression::True.and(a.clone()), a);
        assert!(Expression::True.and(Expression::True).is_trivially_true());
        let b = Expression::compare("x", CompareOp::Ge, 1i64);
        let both = a.and(b);
        assert_eq!(both.filter(&slice()).rows(), 2);
    }

    #[test]
    fn test_or_and_not() {
        let expr = Expression::Or(vec![
            Expression::compare("x", CompareOp::Eq, 0i64),
            Expression::Not(Box::new(Expression::compare("x", CompareOp::Lt, 9i64))),
        ]);
        assert_eq!(expr.filter(&slice()).rows(), 2);
    }

    #[test]
    fn test_display() {
        let expr = Expression::compare("x", CompareOp::Gt, 100i64);
        assert_eq!(expr.to_string(), "x > 100");
    }

    #[test]
    fn test_serde_round_trip() {
        let expr = Expression::compare("x", CompareOp::Ge, 5i64)
            .and(Expression::compare("name", CompareOp::Ne, "n1"));
        let json = serde_json::to_value(&expr).unwrap();
        let back: Expression = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
