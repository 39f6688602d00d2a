//! The `read_lines` parser: bytes to one event per line.

use crate::data::{DataType, Field, Schema, TableSlice, Value};
use crate::error::Result;
use crate::pipeline::context::OperatorControl;
use crate::pipeline::element::ElementType;
use crate::pipeline::generator::{from_fn, Generator, GeneratorExt, Step};
use crate::pipeline::operator::{
    expect_input, Operator, OperatorConfig, OperatorInput, OperatorOutput,
};
use std::sync::Arc;

/// Splits a byte stream at `\n` (dropping a trailing `\r`) into events with
/// a single string field `line`. A line may span any number of chunks; a
/// final line without a newline is emitted at end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLines;

impl ReadLines {
    pub fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            "slipstream.line",
            vec![Field::new("line", DataType::String)],
        ))
    }
}

impl Operator for ReadLines {
    fn name(&self) -> &str {
        "read_lines"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Bytes, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let mut input = input.into_bytes(self.name())?;
        let ctrl = ctrl.clone();
        let schema = Self::schema();
        let mut partial: Vec<u8> = Vec::new();
        let mut finished = false;
        let gen = from_fn(move || {
            if finished {
                return Ok(Step::Done);
            }
            let mut lines = Vec::new();
            match input.next()? {
                Step::Item(chunk) => {
                    let mut rest = chunk.as_bytes();
                    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
                        partial.extend_from_slice(&rest[..pos]);
                        lines.push(decode_line(&ctrl, std::mem::take(&mut partial)));
                        rest = &rest[pos + 1..];
                    }
                    partial.extend_from_slice(rest);
                }
                Step::Pending => return Ok(Step::Pending),
                Step::Done => {
                    finished = true;
                    if partial.is_empty() {
                        return Ok(Step::Done);
                    }
                    lines.push(decode_line(&ctrl, std::mem::take(&mut partial)));
                }
            }
            // A chunk without a newline yields a stub.
            let slice = TableSlice::new(Arc::clone(&schema), vec![lines])?;
            Ok(Step::Item(slice))
        });
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(*self)
    }

    fn to_config(&self) -> Result<OperatorConfig> {
        Ok(OperatorConfig::new(self.name(), serde_json::json!({})))
    }
}

fn decode_line(ctrl: &OperatorControl, mut bytes: Vec<u8>) -> Value {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => Value::String(line),
        Err(err) => {
            ctrl.warn("`read_lines` replaced invalid UTF-8 in its input");
            Value::String(String::from_utf8_lossy(err.as_bytes()).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Chunk;
    use crate::pipeline::generator::from_iter;

    fn lines_of(chunks: Vec<&'static str>) -> Vec<String> {
        let ctrl = crate::pipeline::testing::control("read_lines");
        let input = from_iter(chunks.into_iter().map(Chunk::from)).boxed();
        let OperatorOutput::Events(mut gen) = ReadLines
            .instantiate(OperatorInput::Bytes(input), &ctrl)
            .unwrap()
        else {
            panic!("expected events");
        };
        let mut out = Vec::new();
        while let Step::Item(slice) = gen.next().unwrap() {
            for row in 0..slice.rows() as usize {
                if let Some(Value::String(line)) = slice.value(row, 0) {
                    out.push(line.clone());
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_lines_across_chunks() {
        assert_eq!(
            lines_of(vec!["fo", "o\nba", "r\r\n", "baz"]),
            ["foo", "bar", "baz"]
        );
    }

    #[tokio::test]
    async fn test_empty_lines_are_kept() {
        assert_eq!(lines_of(vec!["a\n\nb\n"]), ["a", "", "b"]);
    }
}
