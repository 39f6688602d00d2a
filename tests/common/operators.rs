//! Operators that only exist to exercise the engine

use slipstream::config::DemandOverrides;
use slipstream::pipeline::generator::from_fn;
use slipstream::pipeline::operator::expect_input;
use slipstream::pipeline::{
    ElementType, Generator, GeneratorExt, Operator, OperatorControl, OperatorInput, OperatorOutput,
    Step,
};
use slipstream::{PipelineError, Result, TableSlice};

use super::builders::numbers;

/// Source that interleaves stubs with data: every round yields an empty
/// slice, then "nothing yet", then a slice of `rows` rows.
#[derive(Debug, Clone)]
pub struct Stubby {
    pub rounds: usize,
    pub rows: i64,
}

impl Operator for Stubby {
    fn name(&self) -> &str {
        "stubby"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Void, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        input.expect_void(self.name())?;
        let (rounds, rows) = (self.rounds, self.rows);
        let mut step = 0usize;
        let gen = from_fn(move || {
            let round = step / 3;
            let phase = step % 3;
            step += 1;
            if round >= rounds {
                return Ok(Step::Done);
            }
            Ok(match phase {
                0 => Step::Item(TableSlice::empty(numbers(0..0).schema().clone())),
                1 => Step::Pending,
                _ => {
                    let start = round as i64 * rows;
                    Step::Item(numbers(start..start + rows))
                }
            })
        });
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

/// Passes `items` slices through, then fails.
#[derive(Debug, Clone)]
pub struct FailAfter {
    pub items: usize,
}

impl Operator for FailAfter {
    fn name(&self) -> &str {
        "fail_after"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        expect_input(self.name(), input, ElementType::Events, ElementType::Events)
    }

    fn instantiate(&self, input: OperatorInput, _ctrl: &OperatorControl) -> Result<OperatorOutput> {
        let mut input = input.into_events(self.name())?;
        let mut remaining = self.items;
        let gen = from_fn(move || match input.next()? {
            Step::Item(slice) if slice.rows() > 0 => {
                if remaining == 0 {
                    return Err(PipelineError::Io("simulated failure".to_string()));
                }
                remaining -= 1;
                Ok(Step::Item(slice))
            }
            Step::Item(_) | Step::Pending => Ok(Step::Pending),
            Step::Done => Ok(Step::Done),
        });
        Ok(OperatorOutput::Events(gen.boxed()))
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(self.clone())
    }
}

/// Runs `inner` with its own demand settings.
#[derive(Debug)]
pub struct WithDemand {
    pub inner: Box<dyn Operator>,
    pub demand: DemandOverrides,
}

impl Operator for WithDemand {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType> {
        self.inner.infer_type(input)
    }

    fn instantiate(&self, input: OperatorInput, ctrl: &OperatorControl) -> Result<OperatorOutput> {
        self.inner.instantiate(input, ctrl)
    }

    fn copy(&self) -> Box<dyn Operator> {
        Box::new(WithDemand {
            inner: self.inner.copy(),
            demand: self.demand,
        })
    }

    fn demand(&self) -> DemandOverrides {
        self.demand
    }
}
