//! Built-in step implementations.
//!
//! [`BuiltinStepExecutor`] covers the string, numeric, regex, JSON,
//! validation, stateful (delta/throttle) and script steps. XML, Prometheus
//! and CSV steps are recognised but report an unsupported-step error.

use super::step_executor::{StepExecutor, StepOutcome};
use crate::scripting::ScriptEngine;
use crate::types::{HistoryValue, Step, StepType, Timespec, ValueType};
use crate::variant::Variant;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

type StepResult = Result<StepOutcome, String>;

/// Compiled patterns kept before older ones are evicted
pub const MAX_CACHED_REGEXES: usize = 1024;

/// Default implementation of every step type
#[derive(Debug)]
pub struct BuiltinStepExecutor {
    scripts: ScriptEngine,
    regexes: RwLock<HashMap<String, Regex>>,
    regex_capacity: usize,
}

impl Default for BuiltinStepExecutor {
    fn default() -> Self {
        Self {
            scripts: ScriptEngine::default(),
            regexes: RwLock::new(HashMap::new()),
            regex_capacity: MAX_CACHED_REGEXES,
        }
    }
}

impl BuiltinStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of compiled patterns kept
    pub fn with_regex_capacity(mut self, capacity: usize) -> Self {
        self.regex_capacity = capacity.max(1);
        self
    }

    #[cfg(test)]
    fn cached_regexes(&self) -> usize {
        self.regexes.read().map(|cache| cache.len()).unwrap_or_default()
    }

    /// Compile a pattern once and reuse it across calls
    fn regex(&self, pattern: &str) -> Result<Regex, String> {
        if let Some(re) = self
            .regexes
            .read()
            .ok()
            .and_then(|cache| cache.get(pattern).cloned())
        {
            return Ok(re);
        }
        let re = Regex::new(pattern)
            .map_err(|e| format!("invalid regular expression \"{}\": {}", pattern, e))?;
        if let Ok(mut cache) = self.regexes.write() {
            if cache.len() >= self.regex_capacity {
                if let Some(victim) = cache.keys().next().cloned() {
                    cache.remove(&victim);
                }
            }
            cache.insert(pattern.to_string(), re.clone());
        }
        Ok(re)
    }

    fn multiplier(&self, value_type: ValueType, value: &Variant, params: &str) -> StepResult {
        let fail = |reason: &str| {
            format!(
                "cannot apply multiplier \"{}\" to value \"{}\" of type \"{}\": {}",
                params,
                value.desc(),
                value.type_desc(),
                reason
            )
        };

        let factor = Variant::numeric(params).ok_or_else(|| fail("invalid multiplier value"))?;
        let input = numeric_input(value).ok_or_else(|| fail("cannot convert value to numeric type"))?;

        if value_type == ValueType::Uint64 {
            if let (Variant::Ui64(a), Variant::Ui64(b)) = (&input, &factor) {
                return a
                    .checked_mul(*b)
                    .map(StepOutcome::value)
                    .ok_or_else(|| fail("value is too large"));
            }
        }

        let product = input.to_dbl().unwrap_or_default() * factor.to_dbl().unwrap_or_default();
        if !product.is_finite() {
            return Err(fail("value is too large"));
        }
        Ok(StepOutcome::value(product))
    }

    fn trim(&self, step_type: StepType, value: &Variant, params: &str) -> StepResult {
        let text = value.to_str().ok_or_else(|| {
            format!(
                "cannot perform trim of value of type \"{}\"",
                value.type_desc()
            )
        })?;
        let set = |c: char| params.contains(c);
        let out = match step_type {
            StepType::RTrim => text.trim_end_matches(set),
            StepType::LTrim => text.trim_start_matches(set),
            _ => text.trim_matches(set),
        };
        Ok(StepOutcome::value(out))
    }

    fn regex_substitute(&self, value: &Variant, params: &str) -> StepResult {
        let (pattern, output) = split_params(params);
        let text = text_input(value)?;
        let re = self.regex(pattern)?;
        match substitute(&re, &text, output) {
            Some(out) => Ok(StepOutcome::value(out)),
            None => Err(format!(
                "cannot perform regular expression \"{}\" match for value of type \"{}\": pattern does not match",
                pattern,
                value.type_desc()
            )),
        }
    }

    fn to_decimal(&self, step_type: StepType, value: &Variant) -> StepResult {
        let text = text_input(value)?;
        let trimmed = text.trim();
        let (parsed, base) = match step_type {
            StepType::Bool2Dec => (parse_bool(trimmed), "boolean"),
            StepType::Oct2Dec => (u64::from_str_radix(trimmed, 8).ok(), "octal"),
            _ => {
                let hex = trimmed.trim_start_matches("0x").trim_start_matches("0X");
                let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
                (u64::from_str_radix(&hex, 16).ok(), "hexadecimal")
            }
        };
        parsed.map(StepOutcome::value).ok_or_else(|| {
            format!(
                "cannot convert value \"{}\" from {} format to decimal",
                text, base
            )
        })
    }

    fn delta(
        &self,
        step_type: StepType,
        value_type: ValueType,
        value: &Variant,
        ts: Timespec,
        history: Option<&HistoryValue>,
    ) -> StepResult {
        let current = match value_type {
            ValueType::Uint64 => value.to_ui64().map(Variant::Ui64),
            _ => numeric_input(value),
        }
        .ok_or_else(|| {
            format!(
                "cannot calculate delta for value \"{}\" of type \"{}\"",
                value.desc(),
                value.type_desc()
            )
        })?;
        let keep = HistoryValue::new(current.clone(), ts);

        let Some(previous) = history.filter(|h| !h.value.is_none()) else {
            return Ok(StepOutcome::with_history(Variant::None, keep));
        };
        if current.compare(&previous.value) == Ordering::Less {
            return Ok(StepOutcome::with_history(Variant::None, keep));
        }

        let result = if step_type == StepType::DeltaSpeed {
            let dt = ts.secs_since(&previous.ts);
            if dt <= 0.0 {
                return Ok(StepOutcome::with_history(Variant::None, keep));
            }
            let diff = current.to_dbl().unwrap_or_default() - previous.value.to_dbl().unwrap_or_default();
            Variant::Dbl(diff / dt)
        } else {
            match (&current, &previous.value) {
                (Variant::Ui64(a), Variant::Ui64(b)) => Variant::Ui64(a - b),
                _ => Variant::Dbl(
                    current.to_dbl().unwrap_or_default() - previous.value.to_dbl().unwrap_or_default(),
                ),
            }
        };
        Ok(StepOutcome::with_history(result, keep))
    }

    fn validate_range(&self, value: &Variant, params: &str) -> StepResult {
        let (min, max) = split_params(params);
        let fail = |reason: String| {
            format!(
                "cannot validate value \"{}\" of type \"{}\": {}",
                value.desc(),
                value.type_desc(),
                reason
            )
        };
        let input = numeric_input(value)
            .and_then(|v| v.to_dbl())
            .ok_or_else(|| fail("value is not numeric".to_string()))?;

        let bound = |text: &str| -> Result<Option<f64>, String> {
            if text.trim().is_empty() {
                return Ok(None);
            }
            Variant::numeric(text)
                .and_then(|v| v.to_dbl())
                .map(Some)
                .ok_or_else(|| fail(format!("invalid range bound \"{}\"", text)))
        };

        let min = bound(min)?;
        let max = bound(max)?;
        let below = min.is_some_and(|m| input < m);
        let above = max.is_some_and(|m| input > m);
        if below || above {
            let show = |b: Option<f64>| b.map(crate::variant::format_dbl).unwrap_or_default();
            return Err(fail(format!(
                "value must be in range [{}, {}]",
                show(min),
                show(max)
            )));
        }
        Ok(StepOutcome::value(value.clone()))
    }

    fn validate_regex(&self, step_type: StepType, value: &Variant, pattern: &str) -> StepResult {
        let text = text_input(value)?;
        let re = self.regex(pattern)?;
        let matched = re.is_match(&text);
        match (step_type, matched) {
            (StepType::ValidateRegex, false) => Err(format!(
                "value \"{}\" does not match regular expression \"{}\"",
                text, pattern
            )),
            (StepType::ValidateNotRegex, true) => Err(format!(
                "value \"{}\" matches regular expression \"{}\"",
                text, pattern
            )),
            _ => Ok(StepOutcome::value(value.clone())),
        }
    }

    fn jsonpath(&self, value: &Variant, path: &str) -> StepResult {
        let doc = parse_json(value)?;
        match json_query(&doc, path)? {
            Some(found) => Ok(StepOutcome::value(json_text(found))),
            None => Err(format!("no data matches the specified path \"{}\"", path)),
        }
    }

    fn error_field_json(&self, value: &Variant, path: &str) -> StepResult {
        let doc = parse_json(value)?;
        match json_query(&doc, path)? {
            Some(found) => Ok(StepOutcome::ExtractedError(json_text(found))),
            None => Ok(StepOutcome::value(value.clone())),
        }
    }

    fn error_field_regex(&self, value: &Variant, params: &str) -> StepResult {
        let (pattern, output) = split_params(params);
        let text = text_input(value)?;
        let re = self.regex(pattern)?;
        match substitute(&re, &text, output) {
            Some(extracted) => Ok(StepOutcome::ExtractedError(extracted)),
            None => Ok(StepOutcome::value(value.clone())),
        }
    }

    fn throttle(
        &self,
        step_type: StepType,
        value: &Variant,
        ts: Timespec,
        params: &str,
        history: Option<&HistoryValue>,
    ) -> StepResult {
        let period = if step_type == StepType::ThrottleTimedValue {
            let secs = params
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid throttling period \"{}\"", params))?;
            Some(f64::from(secs))
        } else {
            None
        };

        if let Some(previous) = history {
            let same = previous.value.compare(value) == Ordering::Equal;
            let within = period.map_or(true, |p| ts.secs_since(&previous.ts) < p);
            if same && within {
                // keep the original timestamp so the period counts from it
                return Ok(StepOutcome::with_history(Variant::None, previous.clone()));
            }
        }
        Ok(StepOutcome::with_history(
            value.clone(),
            HistoryValue::new(value.clone(), ts),
        ))
    }

    fn script(&self, value: &Variant, source: &str) -> StepResult {
        let text = value.to_str().unwrap_or_default();
        match self.scripts.eval(source, &text) {
            Ok(Some(out)) => Ok(StepOutcome::value(out)),
            Ok(None) => Ok(StepOutcome::value(Variant::None)),
            Err(e) => Err(format!("cannot execute script: {}", e)),
        }
    }
}

impl StepExecutor for BuiltinStepExecutor {
    fn execute(
        &self,
        value_type: ValueType,
        value: &Variant,
        ts: Timespec,
        step: &Step,
        history: Option<&HistoryValue>,
    ) -> StepResult {
        let params = step.params.as_str();
        match step.step_type {
            StepType::Multiplier => self.multiplier(value_type, value, params),
            StepType::RTrim | StepType::LTrim | StepType::Trim => {
                self.trim(step.step_type, value, params)
            }
            StepType::RegexSubstitution => self.regex_substitute(value, params),
            StepType::Bool2Dec | StepType::Oct2Dec | StepType::Hex2Dec => {
                self.to_decimal(step.step_type, value)
            }
            StepType::DeltaValue | StepType::DeltaSpeed => {
                self.delta(step.step_type, value_type, value, ts, history)
            }
            StepType::JsonPath => self.jsonpath(value, params),
            StepType::ValidateRange => self.validate_range(value, params),
            StepType::ValidateRegex | StepType::ValidateNotRegex => {
                self.validate_regex(step.step_type, value, params)
            }
            StepType::ErrorFieldJson => self.error_field_json(value, params),
            StepType::ErrorFieldRegex => self.error_field_regex(value, params),
            StepType::ThrottleValue | StepType::ThrottleTimedValue => {
                self.throttle(step.step_type, value, ts, params, history)
            }
            StepType::Script => self.script(value, params),
            StepType::XPath
            | StepType::ErrorFieldXml
            | StepType::PrometheusPattern
            | StepType::PrometheusToJson
            | StepType::CsvToJson => Err(format!(
                "preprocessing step {:?} is not supported",
                step.step_type
            )),
        }
    }
}

/// Split `first\nsecond` parameters
fn split_params(params: &str) -> (&str, &str) {
    params.split_once('\n').unwrap_or((params, ""))
}

fn numeric_input(value: &Variant) -> Option<Variant> {
    match value {
        Variant::Ui64(_) | Variant::Dbl(_) => Some(value.clone()),
        Variant::Str(s) => Variant::numeric(s),
        _ => None,
    }
}

fn text_input(value: &Variant) -> Result<String, String> {
    value.to_str().ok_or_else(|| {
        format!(
            "cannot process value of type \"{}\" as text",
            value.type_desc()
        )
    })
}

fn parse_bool(text: &str) -> Option<u64> {
    const TRUE: &[&str] = &["true", "t", "yes", "y", "on", "up", "running", "enabled", "available", "ok", "master"];
    const FALSE: &[&str] = &["false", "f", "no", "n", "off", "down", "unused", "disabled", "unavailable", "err", "slave"];

    let lower = text.to_ascii_lowercase();
    if TRUE.contains(&lower.as_str()) {
        return Some(1);
    }
    if FALSE.contains(&lower.as_str()) {
        return Some(0);
    }
    Variant::numeric(text)
        .and_then(|v| v.to_dbl())
        .map(|d| u64::from(d != 0.0))
}

/// Expand `\0`..`\9` in `template` with the captures of the first match
fn substitute(re: &Regex, text: &str, template: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(group) = chars.peek().and_then(|d| d.to_digit(10)) {
                chars.next();
                if let Some(m) = caps.get(group as usize) {
                    out.push_str(m.as_str());
                }
                continue;
            }
        }
        out.push(c);
    }
    Some(out)
}

fn parse_json(value: &Variant) -> Result<JsonValue, String> {
    let text = text_input(value)?;
    serde_json::from_str(&text).map_err(|e| format!("cannot parse JSON: {}", e))
}

/// Strings are returned unquoted, everything else as compact JSON
fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse `$.a.b[0]['c d']` into segments
fn parse_json_path(path: &str) -> Result<Vec<PathSegment>, String> {
    let invalid = || format!("invalid JSON path \"{}\"", path);
    let rest = path.trim().strip_prefix('$').ok_or_else(invalid)?;
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&n) = chars.peek() {
                    if n == '.' || n == '[' {
                        break;
                    }
                    key.push(n);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(invalid());
                }
                segments.push(PathSegment::Key(key));
            }
            '[' => {
                let mut inner = String::new();
                for n in chars.by_ref() {
                    if n == ']' {
                        break;
                    }
                    inner.push(n);
                }
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                match quoted {
                    Some(key) => segments.push(PathSegment::Key(key.to_string())),
                    None => segments.push(PathSegment::Index(
                        inner.trim().parse().map_err(|_| invalid())?,
                    )),
                }
            }
            _ => return Err(invalid()),
        }
    }
    Ok(segments)
}

fn json_query<'a>(doc: &'a JsonValue, path: &str) -> Result<Option<&'a JsonValue>, String> {
    let segments = parse_json_path(path)?;
    let mut node = doc;
    for segment in &segments {
        let next = match segment {
            PathSegment::Key(key) => node.get(key.as_str()),
            PathSegment::Index(index) => node.get(*index),
        };
        match next {
            Some(n) => node = n,
            None => return Ok(None),
        }
    }
    Ok(Some(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(value_type: ValueType, value: impl Into<Variant>, step: Step) -> StepResult {
        BuiltinStepExecutor::new().execute(value_type, &value.into(), Timespec::new(100, 0), &step, None)
    }

    fn value_of(outcome: StepOutcome) -> Variant {
        match outcome {
            StepOutcome::Value { value, .. } => value,
            StepOutcome::ExtractedError(e) => panic!("unexpected extracted error {}", e),
        }
    }

    #[test]
    fn test_multiplier() {
        let out = run(ValueType::Float, "21", Step::new(StepType::Multiplier, "2")).unwrap();
        assert_eq!(value_of(out), Variant::Dbl(42.0));

        let out = run(ValueType::Uint64, "21", Step::new(StepType::Multiplier, "2")).unwrap();
        assert_eq!(value_of(out), Variant::Ui64(42));

        let err = run(ValueType::Float, "abc", Step::new(StepType::Multiplier, "2")).unwrap_err();
        assert!(err.starts_with("cannot apply multiplier \"2\" to value \"abc\""));
    }

    #[test]
    fn test_regex_cache_is_bounded() {
        let executor = BuiltinStepExecutor::new().with_regex_capacity(3);
        for i in 0..10 {
            let step = Step::new(StepType::ValidateRegex, format!("^{}$", i));
            let value = Variant::from(i.to_string());
            assert!(executor
                .execute(ValueType::Str, &value, Timespec::new(0, 0), &step, None)
                .is_ok());
        }
        assert_eq!(executor.cached_regexes(), 3);
    }

    #[test]
    fn test_trim() {
        let out = run(ValueType::Str, "xxabcxx", Step::new(StepType::RTrim, "x")).unwrap();
        assert_eq!(value_of(out), Variant::from("xxabc"));
        let out = run(ValueType::Str, "  abc ", Step::new(StepType::Trim, " ")).unwrap();
        assert_eq!(value_of(out), Variant::from("abc"));
    }

    #[test]
    fn test_regex_substitution() {
        let step = Step::new(StepType::RegexSubstitution, "temp=([0-9]+)\n\\1 C");
        let out = run(ValueType::Str, "sensor temp=23 ok", step).unwrap();
        assert_eq!(value_of(out), Variant::from("23 C"));

        let step = Step::new(StepType::RegexSubstitution, "nomatch\n\\0");
        assert!(run(ValueType::Str, "abc", step).is_err());
    }

    #[test]
    fn test_to_decimal() {
        let out = run(ValueType::Uint64, "ff", Step::new(StepType::Hex2Dec, "")).unwrap();
        assert_eq!(value_of(out), Variant::Ui64(255));
        let out = run(ValueType::Uint64, "17", Step::new(StepType::Oct2Dec, "")).unwrap();
        assert_eq!(value_of(out), Variant::Ui64(15));
        let out = run(ValueType::Uint64, "Up", Step::new(StepType::Bool2Dec, "")).unwrap();
        assert_eq!(value_of(out), Variant::Ui64(1));
        assert!(run(ValueType::Uint64, "maybe", Step::new(StepType::Bool2Dec, "")).is_err());
    }

    #[test]
    fn test_delta_speed() {
        let exec = BuiltinStepExecutor::new();
        let step = Step::new(StepType::DeltaSpeed, "");

        let first = exec
            .execute(ValueType::Float, &"10".into(), Timespec::new(0, 0), &step, None)
            .unwrap();
        let StepOutcome::Value { value, history } = first else {
            panic!("expected value");
        };
        assert!(value.is_none());
        let history = history.unwrap();

        let second = exec
            .execute(ValueType::Float, &"15".into(), Timespec::new(10, 0), &step, Some(&history))
            .unwrap();
        assert_eq!(value_of(second), Variant::Dbl(0.5));
    }

    #[test]
    fn test_delta_value_decrease_yields_nothing() {
        let exec = BuiltinStepExecutor::new();
        let step = Step::new(StepType::DeltaValue, "");
        let prev = HistoryValue::new(Variant::Ui64(10), Timespec::new(0, 0));
        let out = exec
            .execute(ValueType::Uint64, &"4".into(), Timespec::new(1, 0), &step, Some(&prev))
            .unwrap();
        assert!(value_of(out).is_none());
        let out = exec
            .execute(ValueType::Uint64, &"14".into(), Timespec::new(1, 0), &step, Some(&prev))
            .unwrap();
        assert_eq!(value_of(out), Variant::Ui64(4));
    }

    #[test]
    fn test_jsonpath() {
        let doc = r#"{"a": {"b": [10, {"c d": "x"}]}}"#;
        let out = run(ValueType::Str, doc, Step::new(StepType::JsonPath, "$.a.b[0]")).unwrap();
        assert_eq!(value_of(out), Variant::from("10"));
        let out = run(ValueType::Str, doc, Step::new(StepType::JsonPath, "$.a.b[1]['c d']")).unwrap();
        assert_eq!(value_of(out), Variant::from("x"));
        assert!(run(ValueType::Str, doc, Step::new(StepType::JsonPath, "$.missing")).is_err());
        assert!(run(ValueType::Str, doc, Step::new(StepType::JsonPath, "a.b")).is_err());
    }

    #[test]
    fn test_error_field_json() {
        let step = Step::new(StepType::ErrorFieldJson, "$.error");
        let out = run(ValueType::Str, r#"{"error": "disk full"}"#, step.clone()).unwrap();
        assert_eq!(out, StepOutcome::ExtractedError("disk full".into()));
        let out = run(ValueType::Str, r#"{"ok": 1}"#, step).unwrap();
        assert_eq!(value_of(out), Variant::from(r#"{"ok": 1}"#));
    }

    #[test]
    fn test_validate_range() {
        let step = Step::new(StepType::ValidateRange, "0\n100");
        assert!(run(ValueType::Float, "50", step.clone()).is_ok());
        let err = run(ValueType::Float, "150", step).unwrap_err();
        assert!(err.contains("value must be in range [0, 100]"));
        assert!(run(ValueType::Float, "-5", Step::new(StepType::ValidateRange, "\n10")).is_ok());
    }

    #[test]
    fn test_validate_regex() {
        assert!(run(ValueType::Str, "abc", Step::new(StepType::ValidateRegex, "^a")).is_ok());
        assert!(run(ValueType::Str, "abc", Step::new(StepType::ValidateNotRegex, "^a")).is_err());
    }

    #[test]
    fn test_throttle() {
        let exec = BuiltinStepExecutor::new();
        let step = Step::new(StepType::ThrottleTimedValue, "60");
        let prev = HistoryValue::new("up", Timespec::new(0, 0));

        let out = exec
            .execute(ValueType::Str, &"up".into(), Timespec::new(30, 0), &step, Some(&prev))
            .unwrap();
        assert_eq!(
            out,
            StepOutcome::with_history(Variant::None, prev.clone())
        );

        let out = exec
            .execute(ValueType::Str, &"up".into(), Timespec::new(61, 0), &step, Some(&prev))
            .unwrap();
        assert_eq!(value_of(out), Variant::from("up"));
    }

    #[test]
    fn test_script() {
        let out = run(
            ValueType::Float,
            "21",
            Step::new(StepType::Script, "to_number(value) * 2.0"),
        )
        .unwrap();
        assert_eq!(value_of(out), Variant::from("42"));
        assert!(run(ValueType::Str, "", Step::new(StepType::Script, "throw \"no\"")).is_err());
    }

    #[test]
    fn test_unsupported_steps() {
        let err = run(ValueType::Str, "<a/>", Step::new(StepType::XPath, "/a")).unwrap_err();
        assert!(err.contains("not supported"));
    }
}
