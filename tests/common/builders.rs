//! Test data builders for creating table slices

use slipstream::{DataType, Field, Schema, TableSlice, Value};
use std::ops::Range;
use std::sync::Arc;

/// Builder for single-column integer slices
pub struct SliceBuilder {
    schema_name: String,
    field: String,
    values: Vec<i64>,
}

impl SliceBuilder {
    pub fn new() -> Self {
        Self {
            schema_name: "test.numbers".to_string(),
            field: "x".to_string(),
            values: Vec::new(),
        }
    }

    pub fn schema_name(mut self, name: &str) -> Self {
        self.schema_name = name.to_string();
        self
    }

    pub fn field(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }

    pub fn values(mut self, values: Range<i64>) -> Self {
        self.values.extend(values);
        self
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(
            self.schema_name.clone(),
            vec![Field::new(self.field.clone(), DataType::Int64)],
        ))
    }

    pub fn build(self) -> TableSlice {
        let column = self.values.iter().copied().map(Value::Int64).collect();
        TableSlice::new(self.schema(), vec![column]).expect("single column")
    }
}

impl Default for SliceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A slice with field `x` holding `values`
pub fn numbers(values: Range<i64>) -> TableSlice {
    SliceBuilder::new().values(values).build()
}

/// `batches` slices of `rows` consecutive numbers each, starting at 0
pub fn numbered_batches(batches: i64, rows: i64) -> Vec<TableSlice> {
    (0..batches)
        .map(|i| numbers(i * rows..(i + 1) * rows))
        .collect()
}

/// Integer values as `Value`s
pub fn ints(values: Range<i64>) -> Vec<Value> {
    values.map(Value::Int64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_builder() {
        let slice = SliceBuilder::new().field("y").values(3..6).build();
        assert_eq!(slice.rows(), 3);
        assert_eq!(slice.schema().field_index("y"), Some(0));
        assert_eq!(slice.value(2, 0), Some(&Value::Int64(5)));
    }

    #[test]
    fn test_numbered_batches_are_contiguous() {
        let batches = numbered_batches(3, 4);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].value(0, 0), Some(&Value::Int64(8)));
    }
}
