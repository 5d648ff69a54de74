//! Step chain execution
//!
//! [`StepChain`] runs an item's steps in order against one value, applying
//! each step's error handler, collecting the history stateful steps want to
//! keep and building the multi-line diagnostic reported when the chain
//! fails. Test mode runs the same steps but records every step's outcome
//! and keeps going past failures.

use super::step_executor::{StepExecutor, StepOutcome};
use crate::config::VALUE_PREVIEW_LEN;
use crate::protocol::{TaskRequest, TaskResult, TestRequest, TestResult};
use crate::types::{
    truncate_error, ErrorHandler, HistoryEntry, HistoryValue, Step, StepResult, Timespec,
    ITEM_ERROR_LEN,
};
use crate::variant::Variant;
use std::sync::Arc;

const ELLIPSIS: &str = "...";

/// Outcome of a single step after its error handler was applied
enum StepStatus {
    /// Chain continues with the current value
    Continue(Option<HistoryValue>),
    /// Chain stops with this error
    Failed(String),
}

/// Runs step chains through a [`StepExecutor`]
#[derive(Clone)]
pub struct StepChain {
    executor: Arc<dyn StepExecutor>,
    max_error_len: usize,
    value_preview_len: usize,
}

impl StepChain {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            max_error_len: ITEM_ERROR_LEN,
            value_preview_len: VALUE_PREVIEW_LEN,
        }
    }

    pub fn with_limits(mut self, max_error_len: usize, value_preview_len: usize) -> Self {
        self.max_error_len = max_error_len;
        self.value_preview_len = value_preview_len;
        self
    }

    /// Execute a production task.
    ///
    /// On failure the result carries no value, the history of the steps
    /// before the failing one, and either the bare handler error (set error
    /// and extracted errors) or a step-by-step diagnostic.
    pub fn execute(&self, task: &TaskRequest) -> TaskResult {
        let ts = task.ts.unwrap_or_else(Timespec::now);
        let mut value = task.value.clone();
        let mut results: Vec<StepResult> = Vec::with_capacity(task.steps.len());
        let mut history = Vec::new();
        let last = task.steps.len().saturating_sub(1);

        for (i, step) in task.steps.iter().enumerate() {
            let previous = step_history(&task.history, i);
            let outcome =
                self.executor
                    .execute(task.value_type, &value, ts, step, previous.as_ref());

            let (status, action) = match outcome {
                Ok(StepOutcome::Value {
                    value: out,
                    history: kept,
                }) => {
                    value = out;
                    (StepStatus::Continue(kept), ErrorHandler::Default)
                }
                Ok(StepOutcome::ExtractedError(error)) => {
                    (StepStatus::Failed(error), ErrorHandler::ForceError)
                }
                Err(error) => (handle_error(step, &mut value, error), step.error_handler),
            };

            match status {
                StepStatus::Failed(error) => {
                    results.push(StepResult {
                        value: Variant::None,
                        error: None,
                        action,
                    });
                    tracing::trace!(itemid = task.itemid, step = i + 1, "Step chain failed");
                    let error = self.report_error(&task.value, &results, &error);
                    return TaskResult {
                        value: Variant::None,
                        history,
                        error: Some(error),
                    };
                }
                StepStatus::Continue(kept) => {
                    // only steps before a failing one are ever shown
                    let snapshot = if i == last {
                        Variant::None
                    } else {
                        value.clone()
                    };
                    results.push(StepResult {
                        value: snapshot,
                        error: None,
                        action,
                    });
                    if let Some(kept) = kept.filter(|h| !h.value.is_none()) {
                        history.push(HistoryEntry::new(i as i32, kept));
                    }
                }
            }

            if value.is_none() {
                break;
            }
        }

        TaskResult {
            value,
            history,
            error: None,
        }
    }

    fn report_error(&self, value_start: &Variant, results: &[StepResult], error: &str) -> String {
        match results.last().map(|r| r.action) {
            Some(ErrorHandler::SetError | ErrorHandler::ForceError) | None => {
                truncate_error(error, self.max_error_len)
            }
            Some(_) => self.format_error(value_start, results, error),
        }
    }

    /// Build the failure diagnostic.
    ///
    /// ```text
    /// Preprocessing failed for: <input>
    /// ...
    /// 2. Result: <value after step 2>
    /// 3. Failed (set value): <error>
    /// ```
    ///
    /// Results of earlier steps are added from the failing step backwards
    /// while they fit in the maximum error length; the `...` line marks
    /// omitted steps.
    pub fn format_error(&self, value_start: &Variant, results: &[StepResult], error: &str) -> String {
        let header = format!(
            "Preprocessing failed for: {}\n",
            format_value(value_start, self.value_preview_len)
        );

        let mut budget = self
            .max_error_len
            .saturating_sub(header.chars().count() + "...\n".len());
        let mut fits = |line: &str| {
            let len = line.chars().count();
            if len > budget {
                return false;
            }
            budget -= len;
            true
        };

        let n = results.len();
        let mut lines = Vec::with_capacity(n);
        if let Some(failed) = results.last() {
            let line = format!("{}. Failed{}: {}", n, failed.action.label(), error)
                .trim_end()
                .to_string();
            let fitted = fits(&line);
            lines.push(line);

            if fitted {
                for (i, result) in results[..n - 1].iter().enumerate().rev() {
                    let line = format!(
                        "{}. Result{}: {}\n",
                        i + 1,
                        result.action.label(),
                        format_value(&result.value, self.value_preview_len)
                    );
                    if !fits(&line) {
                        break;
                    }
                    lines.push(line);
                }
            }
        }

        let mut out = header;
        if lines.len() < n {
            out.push_str("...\n");
        }
        for line in lines.iter().rev() {
            out.push_str(line);
        }
        truncate_error(&out, self.max_error_len)
    }

    /// Execute a test request.
    ///
    /// Every step is recorded with its value, error and the handler that was
    /// applied. Failures do not stop the chain unless the value was
    /// discarded; the first failure becomes the reported error.
    pub fn execute_test(&self, request: &TestRequest) -> TestResult {
        let mut value = Variant::Str(request.value.clone());
        let mut results = Vec::with_capacity(request.steps.len());
        let mut history = Vec::new();
        let mut first_error: Option<String> = None;

        for (i, step) in request.steps.iter().enumerate() {
            let previous = step_history(&request.history, i);
            let outcome = self.executor.execute(
                request.value_type,
                &value,
                request.ts,
                step,
                previous.as_ref(),
            );

            match outcome {
                Ok(StepOutcome::Value {
                    value: out,
                    history: kept,
                }) => {
                    results.push(StepResult {
                        value: out.clone(),
                        error: None,
                        action: ErrorHandler::Default,
                    });
                    if let Some(kept) = kept.filter(|h| !h.value.is_none()) {
                        history.push(HistoryEntry::new(i as i32, kept));
                    }
                    value = out;
                }
                Ok(StepOutcome::ExtractedError(error)) => {
                    first_error.get_or_insert_with(|| error.clone());
                    results.push(StepResult {
                        value: Variant::None,
                        error: Some(error),
                        action: ErrorHandler::ForceError,
                    });
                }
                Err(error) => {
                    let action = step.error_handler;
                    let shown = match action {
                        ErrorHandler::SetValue => {
                            value = Variant::Str(step.error_handler_params.clone());
                            value.clone()
                        }
                        ErrorHandler::DiscardValue => {
                            value = Variant::None;
                            Variant::None
                        }
                        ErrorHandler::SetError => {
                            first_error
                                .get_or_insert_with(|| step.error_handler_params.clone());
                            Variant::None
                        }
                        ErrorHandler::Default | ErrorHandler::ForceError => {
                            first_error.get_or_insert_with(|| error.clone());
                            Variant::None
                        }
                    };
                    results.push(StepResult {
                        value: shown,
                        error: Some(error),
                        action,
                    });
                }
            }

            if value.is_none() {
                break;
            }
        }

        TestResult {
            results,
            history,
            error: first_error.map(|e| truncate_error(&e, self.max_error_len)),
        }
    }
}

impl std::fmt::Debug for StepChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepChain")
            .field("max_error_len", &self.max_error_len)
            .field("value_preview_len", &self.value_preview_len)
            .finish()
    }
}

/// Apply the step's error handler to a failed step.
///
/// History produced by a failed step is never kept.
fn handle_error(step: &Step, value: &mut Variant, error: String) -> StepStatus {
    match step.error_handler {
        ErrorHandler::DiscardValue => {
            *value = Variant::None;
            StepStatus::Continue(None)
        }
        ErrorHandler::SetValue => {
            *value = Variant::Str(step.error_handler_params.clone());
            StepStatus::Continue(None)
        }
        ErrorHandler::SetError => StepStatus::Failed(step.error_handler_params.clone()),
        ErrorHandler::Default | ErrorHandler::ForceError => StepStatus::Failed(error),
    }
}

fn step_history(history: &[HistoryEntry], index: usize) -> Option<HistoryValue> {
    history
        .iter()
        .find(|h| h.index as usize == index)
        .map(HistoryEntry::to_history_value)
}

/// Value preview for diagnostics: shortened with "..." and control
/// characters replaced by '.'
fn format_value(value: &Variant, preview_len: usize) -> String {
    let desc = value.desc();
    let shown: String = if desc.chars().count() > preview_len {
        let keep = preview_len.saturating_sub(ELLIPSIS.len());
        desc.chars().take(keep).chain(ELLIPSIS.chars()).collect()
    } else {
        desc
    };
    shown
        .chars()
        .map(|c| if c.is_control() { '.' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::steps::BuiltinStepExecutor;
    use crate::types::{StepType, ValueType};

    fn chain() -> StepChain {
        StepChain::new(Arc::new(BuiltinStepExecutor::new()))
    }

    fn task(value_type: ValueType, value: &str, steps: Vec<Step>) -> TaskRequest {
        TaskRequest {
            itemid: 1,
            value_type,
            ts: Some(Timespec::new(100, 0)),
            value: value.into(),
            history: Vec::new(),
            steps,
        }
    }

    #[test]
    fn test_multiply_chain() {
        let result = chain().execute(&task(
            ValueType::Float,
            "21",
            vec![Step::new(StepType::Multiplier, "2")],
        ));
        assert_eq!(result.value, Variant::Dbl(42.0));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_set_error_reports_bare_error() {
        let steps = vec![
            Step::new(StepType::Trim, " "),
            Step::new(StepType::Multiplier, "1"),
            Step::new(StepType::ValidateRange, "0\n10")
                .on_fail(ErrorHandler::SetError, "out of range"),
            Step::new(StepType::Multiplier, "2"),
            Step::new(StepType::Multiplier, "3"),
        ];
        let result = chain().execute(&task(ValueType::Float, " 50 ", steps));
        assert_eq!(result.value, Variant::None);
        assert_eq!(result.error.as_deref(), Some("out of range"));
    }

    #[test]
    fn test_set_error_truncated() {
        let long = "e".repeat(300);
        let steps = vec![Step::new(StepType::ValidateRegex, "^x")
            .on_fail(ErrorHandler::SetError, long.clone())];
        let result = chain()
            .with_limits(64, VALUE_PREVIEW_LEN)
            .execute(&task(ValueType::Str, "abc", steps));
        let error = result.error.unwrap();
        assert_eq!(error.chars().count(), 64);
        assert!(error.ends_with("..."));
    }

    #[test]
    fn test_default_failure_diagnostic() {
        let steps = vec![
            Step::new(StepType::Trim, " "),
            Step::new(StepType::Multiplier, "abc"),
        ];
        let result = chain().execute(&task(ValueType::Float, " 5 ", steps));
        let error = result.error.unwrap();
        let lines: Vec<&str> = error.lines().collect();
        assert_eq!(lines[0], "Preprocessing failed for:  5 ");
        assert_eq!(lines[1], "1. Result: 5");
        assert!(lines[2].starts_with("2. Failed: cannot apply multiplier \"abc\""));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_diagnostic_omits_steps_that_do_not_fit() {
        let chain = chain().with_limits(120, VALUE_PREVIEW_LEN);
        let results = vec![
            StepResult {
                value: Variant::from("a".repeat(60)),
                error: None,
                action: ErrorHandler::Default,
            },
            StepResult {
                value: Variant::from("b"),
                error: None,
                action: ErrorHandler::SetValue,
            },
            StepResult {
                value: Variant::None,
                error: None,
                action: ErrorHandler::Default,
            },
        ];
        let error = chain.format_error(&Variant::from("in"), &results, "boom");
        assert_eq!(
            error,
            "Preprocessing failed for: in\n...\n2. Result (set value): b\n3. Failed: boom"
        );
    }

    #[test]
    fn test_format_value_preview() {
        let long = "x".repeat(150);
        let shown = format_value(&Variant::from(long.as_str()), VALUE_PREVIEW_LEN);
        assert_eq!(shown.chars().count(), VALUE_PREVIEW_LEN);
        assert!(shown.ends_with("..."));
        assert_eq!(format_value(&Variant::from("a\tb\n"), 100), "a.b.");
    }

    #[test]
    fn test_discard_value_is_not_an_error() {
        let steps = vec![
            Step::new(StepType::ValidateRegex, "^x").on_fail(ErrorHandler::DiscardValue, ""),
            Step::new(StepType::Multiplier, "2"),
        ];
        let result = chain().execute(&task(ValueType::Str, "abc", steps));
        assert_eq!(result.value, Variant::None);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_set_value_continues() {
        let steps = vec![
            Step::new(StepType::Multiplier, "2").on_fail(ErrorHandler::SetValue, "7"),
            Step::new(StepType::Multiplier, "3"),
        ];
        let result = chain().execute(&task(ValueType::Float, "abc", steps));
        assert_eq!(result.value, Variant::Dbl(21.0));
    }

    #[test]
    fn test_extracted_error() {
        let steps = vec![
            Step::new(StepType::ErrorFieldJson, "$.error"),
            Step::new(StepType::JsonPath, "$.value"),
        ];
        let result = chain().execute(&task(ValueType::Str, r#"{"error": "boom"}"#, steps));
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_failing_step_history_dropped() {
        let steps = vec![
            Step::new(StepType::DeltaValue, ""),
            Step::new(StepType::ThrottleValue, ""),
            Step::new(StepType::ValidateRange, "\n0"),
        ];
        let mut request = task(ValueType::Uint64, "15", steps);
        request.history = vec![HistoryEntry::new(
            0,
            HistoryValue::new(Variant::Ui64(10), Timespec::new(90, 0)),
        )];
        let result = chain().execute(&request);
        assert!(result.error.is_some());
        assert_eq!(result.history.len(), 2);
        assert_eq!(result.history[0].value, Variant::Ui64(15));
        assert_eq!(result.history[1].index, 1);
    }

    #[test]
    fn test_test_mode_continues_after_failure() {
        let request = TestRequest {
            value_type: ValueType::Float,
            value: "abc".into(),
            ts: Timespec::new(100, 0),
            history: Vec::new(),
            steps: vec![
                Step::new(StepType::Multiplier, "2"),
                Step::new(StepType::RTrim, "c"),
            ],
        };
        let result = chain().execute_test(&request);
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].error.is_some());
        assert_eq!(result.results[0].action, ErrorHandler::Default);
        assert_eq!(result.results[1].value, Variant::from("ab"));
        assert!(result.error.unwrap().starts_with("cannot apply multiplier"));
    }

    #[test]
    fn test_test_mode_records_history() {
        let request = TestRequest {
            value_type: ValueType::Uint64,
            value: "10".into(),
            ts: Timespec::new(0, 0),
            history: Vec::new(),
            steps: vec![Step::new(StepType::DeltaValue, "")],
        };
        let result = chain().execute_test(&request);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].value, Variant::None);
        assert_eq!(result.history.len(), 1);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_test_mode_stops_when_value_is_gone() {
        // first delta sample has nothing to compare with
        let request = TestRequest {
            value_type: ValueType::Uint64,
            value: "10".into(),
            ts: Timespec::new(0, 0),
            history: Vec::new(),
            steps: vec![
                Step::new(StepType::DeltaValue, ""),
                Step::new(StepType::Multiplier, "2"),
            ],
        };
        let result = chain().execute_test(&request);
        assert_eq!(result.results.len(), 1);
        assert!(result.error.is_none());

        let request = TestRequest {
            value_type: ValueType::Float,
            value: "abc".into(),
            ts: Timespec::new(0, 0),
            history: Vec::new(),
            steps: vec![
                Step::new(StepType::ValidateRegex, "^[0-9]+$")
                    .on_fail(ErrorHandler::DiscardValue, ""),
                Step::new(StepType::RTrim, "c"),
            ],
        };
        let result = chain().execute_test(&request);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].action, ErrorHandler::DiscardValue);
        assert_eq!(result.results[0].value, Variant::None);
        assert!(result.error.is_none());
    }
}
