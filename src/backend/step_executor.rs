//! The seam between the step chain and individual step implementations.

use crate::types::{HistoryValue, Step, Timespec, ValueType};
use crate::variant::Variant;

/// What a single step produced when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The transformed value, `Variant::None` when the step yields nothing
    /// (first delta sample, throttled duplicate), plus the history to keep
    /// for this step.
    Value {
        value: Variant,
        history: Option<HistoryValue>,
    },
    /// The value was valid but carried an embedded error. The chain fails
    /// with this text even though the step itself succeeded.
    ExtractedError(String),
}

impl StepOutcome {
    pub fn value(value: impl Into<Variant>) -> Self {
        StepOutcome::Value {
            value: value.into(),
            history: None,
        }
    }

    pub fn with_history(value: impl Into<Variant>, history: HistoryValue) -> Self {
        StepOutcome::Value {
            value: value.into(),
            history: Some(history),
        }
    }
}

/// Runs one configured step.
///
/// Implementations must be stateless across calls: anything a step needs to
/// remember travels through `history`. An `Err` is the step's failure text,
/// which the chain then handles according to the step's error handler.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        value_type: ValueType,
        value: &Variant,
        ts: Timespec,
        step: &Step,
        history: Option<&HistoryValue>,
    ) -> Result<StepOutcome, String>;
}
