//! The closed set of element types exchanged between operators.
//!
//! Every edge of a pipeline carries exactly one of `void`, `bytes` (chunks)
//! or `events` (table slices). Execution nodes are specialized over a pair
//! of [`Element`] types, so buffering, splitting and delivery are written
//! once and stay strongly typed.

use crate::data::{Chunk, TableSlice};
use crate::error::{PipelineError, Result};
use crate::pipeline::generator::BoxGenerator;
use crate::pipeline::operator::{OperatorInput, OperatorOutput};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a pipeline edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Void,
    Bytes,
    Events,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Void => write!(f, "void"),
            ElementType::Bytes => write!(f, "bytes"),
            ElementType::Events => write!(f, "events"),
        }
    }
}

/// Marker yielded by sinks: one step of consumption, no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Void;

/// A batch of units travelling in one push.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Bytes(Vec<Chunk>),
    Events(Vec<TableSlice>),
}

impl Batch {
    pub fn element_type(&self) -> ElementType {
        match self {
            Batch::Bytes(_) => ElementType::Bytes,
            Batch::Events(_) => ElementType::Events,
        }
    }

    /// Total size: rows for events, bytes for chunks.
    pub fn size(&self) -> u64 {
        match self {
            Batch::Bytes(chunks) => total_size(chunks),
            Batch::Events(slices) => total_size(slices),
        }
    }

    /// Number of units (chunks or slices) in the batch.
    pub fn len(&self) -> usize {
        match self {
            Batch::Bytes(chunks) => chunks.len(),
            Batch::Events(slices) => slices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_events(self) -> Option<Vec<TableSlice>> {
        match self {
            Batch::Events(slices) => Some(slices),
            Batch::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<Chunk>> {
        match self {
            Batch::Bytes(chunks) => Some(chunks),
            Batch::Events(_) => None,
        }
    }
}

/// A unit type that can flow through an execution node.
pub trait Element: Sized + Send + 'static {
    const TYPE: ElementType;

    /// Rows for table slices, bytes for chunks, zero for void.
    fn size(&self) -> u64;

    /// Split into the first `n` size units and the rest.
    fn split_at(&self, n: u64) -> (Self, Self);

    /// Wrap units for delivery. `None` for void, which is never delivered.
    fn into_batch(units: Vec<Self>) -> Option<Batch>;

    /// Unwrap a delivered batch, failing on a type mismatch.
    fn from_batch(batch: Batch) -> Result<Vec<Self>>;

    fn into_input(gen: BoxGenerator<Self>) -> OperatorInput;

    fn from_output(output: OperatorOutput) -> Result<BoxGenerator<Self>>;
}

impl Element for Void {
    const TYPE: ElementType = ElementType::Void;

    fn size(&self) -> u64 {
        0
    }

    fn split_at(&self, _n: u64) -> (Self, Self) {
        (Void, Void)
    }

    fn into_batch(_units: Vec<Self>) -> Option<Batch> {
        None
    }

    fn from_batch(batch: Batch) -> Result<Vec<Self>> {
        Err(PipelineError::TypeMismatch(format!(
            "received {} but expected no input",
            batch.element_type()
        )))
    }

    fn into_input(_gen: BoxGenerator<Self>) -> OperatorInput {
        OperatorInput::Void
    }

    fn from_output(output: OperatorOutput) -> Result<BoxGenerator<Self>> {
        match output {
            OperatorOutput::Void(gen) => Ok(gen),
            other => Err(mismatch(ElementType::Void, other.element_type())),
        }
    }
}

impl Element for Chunk {
    const TYPE: ElementType = ElementType::Bytes;

    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn split_at(&self, n: u64) -> (Self, Self) {
        Chunk::split_at(self, n as usize)
    }

    fn into_batch(units: Vec<Self>) -> Option<Batch> {
        Some(Batch::Bytes(units))
    }

    fn from_batch(batch: Batch) -> Result<Vec<Self>> {
        match batch {
            Batch::Bytes(chunks) => Ok(chunks),
            other => Err(mismatch(ElementType::Bytes, other.element_type())),
        }
    }

    fn into_input(gen: BoxGenerator<Self>) -> OperatorInput {
        OperatorInput::Bytes(gen)
    }

    fn from_output(output: OperatorOutput) -> Result<BoxGenerator<Self>> {
        match output {
            OperatorOutput::Bytes(gen) => Ok(gen),
            other => Err(mismatch(ElementType::Bytes, other.element_type())),
        }
    }
}

impl Element for TableSlice {
    const TYPE: ElementType = ElementType::Events;

    fn size(&self) -> u64 {
        self.rows()
    }

    fn split_at(&self, n: u64) -> (Self, Self) {
        TableSlice::split_at(self, n)
    }

    fn into_batch(units: Vec<Self>) -> Option<Batch> {
        Some(Batch::Events(units))
    }

    fn from_batch(batch: Batch) -> Result<Vec<Self>> {
        match batch {
            Batch::Events(slices) => Ok(slices),
            other => Err(mismatch(ElementType::Events, other.element_type())),
        }
    }

    fn into_input(gen: BoxGenerator<Self>) -> OperatorInput {
        OperatorInput::Events(gen)
    }

    fn from_output(output: OperatorOutput) -> Result<BoxGenerator<Self>> {
        match output {
            OperatorOutput::Events(gen) => Ok(gen),
            other => Err(mismatch(ElementType::Events, other.element_type())),
        }
    }
}

fn mismatch(expected: ElementType, actual: ElementType) -> PipelineError {
    PipelineError::TypeMismatch(format!("expected {} but got {}", expected, actual))
}

/// Sum of the sizes of `units`.
pub fn total_size<T: Element>(units: &[T]) -> u64 {
    units.iter().map(Element::size).sum()
}

/// Split a sequence of units at `point` size units.
///
/// A unit straddling the boundary is sub-sliced, so the left side holds
/// exactly `min(point, total)` units of size and no data is lost or
/// reordered.
pub fn split<T: Element>(units: Vec<T>, point: u64) -> (Vec<T>, Vec<T>) {
    let mut lhs = Vec::new();
    let mut rhs = Vec::new();
    let mut remaining = point;
    for unit in units {
        if remaining == 0 {
            rhs.push(unit);
            continue;
        }
        let size = unit.size();
        if size <= remaining {
            remaining -= size;
            lhs.push(unit);
        } else {
            let (head, tail) = unit.split_at(remaining);
            remaining = 0;
            lhs.push(head);
            rhs.push(tail);
        }
    }
    (lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field, Schema, TableSliceBuilder, Value};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn chunks_from(sizes: &[usize]) -> Vec<Chunk> {
        let mut next = 0u8;
        sizes
            .iter()
            .map(|&n| {
                let data: Vec<u8> = (0..n)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect();
                Chunk::from(data)
            })
            .collect()
    }

    fn slices_from(sizes: &[usize]) -> Vec<TableSlice> {
        let schema = Arc::new(Schema::new("s", vec![Field::new("x", DataType::Int64)]));
        let mut value = 0i64;
        sizes
            .iter()
            .map(|&n| {
                let mut builder = TableSliceBuilder::new(Arc::clone(&schema));
                for _ in 0..n {
                    builder.push_row(vec![Value::Int64(value)]).unwrap();
                    value += 1;
                }
                builder.finish().unwrap()
            })
            .collect()
    }

    fn flatten_bytes(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.as_bytes().to_vec()).collect()
    }

    fn flatten_rows(slices: &[TableSlice]) -> Vec<Value> {
        slices
            .iter()
            .flat_map(|s| s.column(0).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_split_mid_unit() {
        let units = chunks_from(&[4, 4]);
        let (lhs, rhs) = split(units, 6);
        assert_eq!(total_size(&lhs), 6);
        assert_eq!(total_size(&rhs), 2);
        assert_eq!(lhs.len(), 2);
        assert_eq!(rhs.len(), 1);
    }

    #[test]
    fn test_split_at_zero_and_total() {
        let (lhs, rhs) = split(slices_from(&[3, 2]), 0);
        assert!(lhs.is_empty());
        assert_eq!(total_size(&rhs), 5);

        let (lhs, rhs) = split(slices_from(&[3, 2]), 5);
        assert_eq!(total_size(&lhs), 5);
        assert!(rhs.is_empty());
    }

    #[test]
    fn test_batch_type_checks() {
        let batch = Batch::Bytes(chunks_from(&[3]));
        assert_eq!(batch.size(), 3);
        assert!(TableSlice::from_batch(batch.clone()).is_err());
        assert!(Void::from_batch(batch.clone()).is_err());
        assert_eq!(Chunk::from_batch(batch).unwrap().len(), 1);
        assert!(Void::into_batch(vec![Void]).is_none());
    }

    proptest! {
        #[test]
        fn prop_split_bytes_round_trip(
            sizes in prop::collection::vec(1usize..64, 0..8),
            point in 0u64..600,
        ) {
            let units = chunks_from(&sizes);
            let total = total_size(&units);
            let original = flatten_bytes(&units);
            let (lhs, rhs) = split(units, point);
            prop_assert_eq!(total_size(&lhs), point.min(total));
            prop_assert_eq!(total_size(&lhs) + total_size(&rhs), total);
            let mut joined = flatten_bytes(&lhs);
            joined.extend(flatten_bytes(&rhs));
            prop_assert_eq!(joined, original);
        }

        #[test]
        fn prop_split_rows_round_trip(
            sizes in prop::collection::vec(1usize..32, 0..8),
            point in 0u64..300,
        ) {
            let units = slices_from(&sizes);
            let total = total_size(&units);
            let original = flatten_rows(&units);
            let (lhs, rhs) = split(units, point);
            prop_assert_eq!(total_size(&lhs), point.min(total));
            prop_assert_eq!(total_size(&lhs) + total_size(&rhs), total);
            prop_assert!(lhs.iter().chain(rhs.iter()).all(|s| s.rows() > 0));
            let mut joined = flatten_rows(&lhs);
            joined.extend(flatten_rows(&rhs));
            prop_assert_eq!(joined, original);
        }
    }
}
