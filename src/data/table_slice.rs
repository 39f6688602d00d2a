//! Columnar batches of events.

use super::{Schema, Value};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// An immutable, reference-counted window over columnar event data.
///
/// Cloning and sub-slicing never copy cell values; both share the
/// underlying columns and only adjust the row window. `offset` is the
/// position of the first row in some larger logical stream and moves with
/// the window.
#[derive(Clone)]
pub struct TableSlice {
    schema: Arc<Schema>,
    columns: Arc<Vec<Vec<Value>>>,
    begin: usize,
    end: usize,
    offset: u64,
    import_time: Option<DateTime<Utc>>,
}

impl TableSlice {
    /// Build a slice from column vectors. All columns must have the same
    /// length and there must be one column per schema field.
    pub fn new(schema: Arc<Schema>, columns: Vec<Vec<Value>>) -> Result<Self> {
        if columns.len() != schema.len() {
            return Err(PipelineError::logic(format!(
                "schema `{}` has {} fields but {} columns were given",
                schema.name,
                schema.len(),
                columns.len()
            )));
        }
        let rows = columns.first().map_or(0, Vec::len);
        if let Some(bad) = columns.iter().position(|c| c.len() != rows) {
            return Err(PipelineError::logic(format!(
                "column {} of schema `{}` has {} rows, expected {}",
                bad,
                schema.name,
                columns[bad].len(),
                rows
            )));
        }
        Ok(Self {
            schema,
            columns: Arc::new(columns),
            begin: 0,
            end: rows,
            offset: 0,
            import_time: None,
        })
    }

    /// A slice with no rows of the given schema.
    pub fn empty(schema: Arc<Schema>) -> Self {
        let columns = vec![Vec::new(); schema.len()];
        Self {
            schema,
            columns: Arc::new(columns),
            begin: 0,
            end: 0,
            offset: 0,
            import_time: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn rows(&self) -> u64 {
        (self.end - self.begin) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn columns(&self) -> usize {
        self.columns.len()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn import_time(&self) -> Option<DateTime<Utc>> {
        self.import_time
    }

    pub fn set_import_time(&mut self, time: DateTime<Utc>) {
        self.import_time = Some(time);
    }

    /// Cell at `row` (relative to this slice) and `column`.
    pub fn value(&self, row: usize, column: usize) -> Option<&Value> {
        if row >= self.end - self.begin {
            return None;
        }
        self.columns.get(column)?.get(self.begin + row)
    }

    /// Cells of one column within this slice's window.
    pub fn column(&self, column: usize) -> Option<&[Value]> {
        self.columns.get(column).map(|c| &c[self.begin..self.end])
    }

    /// Cells of the named field within this slice's window.
    pub fn column_by_name(&self, name: &str) -> Option<&[Value]> {
        self.column(self.schema.field_index(name)?)
    }

    /// One row, cloned out of the columns.
    pub fn row(&self, row: usize) -> Option<Vec<Value>> {
        (0..self.columns.len())
            .map(|col| self.value(row, col).cloned())
            .collect()
    }

    /// Rows `[begin, end)` of this slice, clamped to its length.
    pub fn subslice(&self, begin: u64, end: u64) -> TableSlice {
        let rows = self.rows();
        let end = end.min(rows);
        let begin = begin.min(end);
        TableSlice {
            schema: Arc::clone(&self.schema),
            columns: Arc::clone(&self.columns),
            begin: self.begin + begin as usize,
            end: self.begin + end as usize,
            offset: self.offset + begin,
            import_time: self.import_time,
        }
    }

    /// Split into the first `n` rows and the rest.
    pub fn split_at(&self, n: u64) -> (TableSlice, TableSlice) {
        (self.subslice(0, n), self.subslice(n, self.rows()))
    }

    /// Materialize the rows for which `keep` returns true into a new slice.
    pub fn filter_rows<F>(&self, mut keep: F) -> TableSlice
    where
        F: FnMut(usize) -> bool,
    {
        let selected: Vec<usize> = (0..self.rows() as usize).filter(|&r| keep(r)).collect();
        if selected.len() as u64 == self.rows() {
            return self.clone();
        }
        let columns = self
            .columns
            .iter()
            .map(|col| selected.iter().map(|&r| col[self.begin + r].clone()).collect())
            .collect::<Vec<Vec<Value>>>();
        let rows = selected.len();
        TableSlice {
            schema: Arc::clone(&self.schema),
            columns: Arc::new(columns),
            begin: 0,
            end: rows,
            offset: self.offset,
            import_time: self.import_time,
        }
    }

    /// Approximate size in bytes of the rows in this window.
    pub fn approx_bytes(&self) -> u64 {
        self.columns
            .iter()
            .map(|col| {
                col[self.begin..self.end]
                    .iter()
                    .map(Value::approx_bytes)
                    .sum::<u64>()
            })
            .sum()
    }

    /// Concatenate slices that share a schema into one slice.
    pub fn concatenate(slices: &[TableSlice]) -> Result<TableSlice> {
        let Some(first) = slices.first() else {
            return Err(PipelineError::logic("cannot concatenate zero table slices"));
        };
        if slices.len() == 1 {
            return Ok(first.clone());
        }
        let mut columns = vec![Vec::new(); first.columns()];
        for slice in slices {
            if *slice.schema != *first.schema {
                return Err(PipelineError::TypeMismatch(format!(
                    "cannot concatenate slices of schema `{}` and `{}`",
                    first.schema.name, slice.schema.name
                )));
            }
            for (i, column) in columns.iter_mut().enumerate() {
                if let Some(values) = slice.column(i) {
                    column.extend_from_slice(values);
                }
            }
        }
        let mut result = TableSlice::new(Arc::clone(&first.schema), columns)?;
        result.offset = first.offset;
        result.import_time = first.import_time;
        Ok(result)
    }
}

impl Default for TableSlice {
    fn default() -> Self {
        TableSlice::empty(Arc::new(Schema::default()))
    }
}

impl PartialEq for TableSlice {
    /// Slices are equal when they hold the same rows of the same schema.
    fn eq(&self, other: &Self) -> bool {
        if self.rows() != other.rows() || *self.schema != *other.schema {
            return false;
        }
        (0..self.columns()).all(|c| self.column(c) == other.column(c))
    }
}

impl fmt::Debug for TableSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSlice")
            .field("schema", &self.schema.name)
            .field("rows", &self.rows())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Row-wise builder for table slices.
pub struct TableSliceBuilder {
    schema: Arc<Schema>,
    columns: Vec<Vec<Value>>,
}

impl TableSliceBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        let columns = vec![Vec::new(); schema.len()];
        Self { schema, columns }
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::logic(format!(
                "row has {} values but schema `{}` has {} fields",
                row.len(),
                self.schema.name,
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Finish the current slice and reset the builder.
    pub fn finish(&mut self) -> Result<TableSlice> {
        let columns = std::mem::replace(&mut self.columns, vec![Vec::new(); self.schema.len()]);
        TableSlice::new(Arc::clone(&self.schema), columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Field};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            "test",
            vec![
                Field::new("x", DataType::Int64),
                Field::new("s", DataType::String),
            ],
        ))
    }

    fn slice(rows: i64) -> TableSlice {
        let mut builder = TableSliceBuilder::new(schema());
        for i in 0..rows {
            builder
                .push_row(vec![Value::Int64(i), Value::String(format!("r{}", i))])
                .unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_new_rejects_ragged_columns() {
        let result = TableSlice::new(
            schema(),
            vec![vec![Value::Int64(1)], vec![]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_subslice_adjusts_offset() {
        let mut s = slice(10);
        s.set_offset(100);
        let sub = s.subslice(3, 7);
        assert_eq!(sub.rows(), 4);
        assert_eq!(sub.offset(), 103);
        assert_eq!(sub.value(0, 0), Some(&Value::Int64(3)));
        assert_eq!(sub.value(4, 0), None);
    }

    #[test]
    fn test_split_at_bounds() {
        let s = slice(5);
        let (lhs, rhs) = s.split_at(0);
        assert!(lhs.is_empty());
        assert_eq!(rhs.rows(), 5);
        let (lhs, rhs) = s.split_at(9);
        assert_eq!(lhs.rows(), 5);
        assert!(rhs.is_empty());
    }

    #[test]
    fn test_filter_rows() {
        let s = slice(10);
        let even = s.filter_rows(|r| r % 2 == 0);
        assert_eq!(even.rows(), 5);
        assert_eq!(even.value(1, 0), Some(&Value::Int64(2)));
    }

    #[test]
    fn test_concatenate_round_trip() {
        let s = slice(8);
        let (a, b) = s.split_at(3);
        let joined = TableSlice::concatenate(&[a, b]).unwrap();
        assert_eq!(joined, s);
    }

    #[test]
    fn test_builder_rejects_wrong_arity() {
        let mut builder = TableSliceBuilder::new(schema());
        assert!(builder.push_row(vec![Value::Int64(1)]).is_err());
    }

    #[test]
    fn test_default_is_stub() {
        assert!(TableSlice::default().is_empty());
    }
}
