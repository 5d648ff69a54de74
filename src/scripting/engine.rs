//! Rhai Script Engine Implementation
//!
//! One engine is shared by every worker. Scripts are compiled once and
//! cached by source; each run gets a fresh scope holding `value`.

use crate::error::{PreprocError, Result};
use crate::scripting::{create_shared_cache, CompiledScript, SharedScriptCache};
use crate::variant::format_dbl;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};

/// The script engine used by the `Script` step
pub struct ScriptEngine {
    engine: Engine,
    cache: SharedScriptCache,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_cache(create_shared_cache())
    }

    /// Create an engine over an existing cache
    pub fn with_cache(cache: SharedScriptCache) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);
        Self { engine, cache }
    }

    /// Safety limits and helper functions
    fn configure_engine(engine: &mut Engine) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        engine.register_fn(
            "to_number",
            |text: &str| -> std::result::Result<f64, Box<EvalAltResult>> {
                text.trim()
                    .parse::<f64>()
                    .map_err(|_| format!("cannot convert \"{}\" to a number", text).into())
            },
        );

        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("sqrt", |x: f64| x.sqrt());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("ln", |x: f64| x.ln());
        engine.register_fn("log10", |x: f64| x.log10());
        engine.register_fn("floor", |x: f64| x.floor());
        engine.register_fn("ceil", |x: f64| x.ceil());
        engine.register_fn("round", |x: f64| x.round());
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
    }

    /// Compile a script and cache it
    pub fn compile(&self, source: &str) -> Result<CompiledScript> {
        if let Some(script) = self
            .cache
            .read()
            .map_err(|e| PreprocError::Script(format!("Failed to acquire cache lock: {}", e)))?
            .get(source)
        {
            return Ok(script);
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|e| PreprocError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.get_or_compile(&self.engine, source)
    }

    /// Run a compiled script against `value`.
    ///
    /// Returns `None` when the script evaluates to `()`.
    pub fn execute(&self, script: &CompiledScript, value: &str) -> Result<Option<String>> {
        let mut scope = Scope::new();
        scope.push("value", value.to_string());

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &script.ast)
            .map_err(PreprocError::from_rhai_error)?;
        dynamic_to_text(result)
    }

    /// Compile (or reuse) and run in one step
    pub fn eval(&self, source: &str, value: &str) -> Result<Option<String>> {
        let script = self.compile(source)?;
        self.execute(&script, value)
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| PreprocError::Script(format!("Validation error: {}", e)))
    }

    pub fn cache(&self) -> &SharedScriptCache {
        &self.cache
    }
}

fn dynamic_to_text(value: Dynamic) -> Result<Option<String>> {
    if value.is_unit() {
        return Ok(None);
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Some)
            .map_err(|t| PreprocError::Script(format!("Unexpected script result type {}", t)));
    }
    if let Ok(f) = value.as_float() {
        return Ok(Some(format_dbl(f)));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Some(i.to_string()));
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Some(b.to_string()));
    }
    Err(PreprocError::Script(format!(
        "Script returned unsupported type {}",
        value.type_name()
    )))
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cache_size", &self.cache.read().map(|c| c.len()).ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_result() {
        let engine = ScriptEngine::new();
        let result = engine.eval("value + \"-suffix\"", "abc").unwrap();
        assert_eq!(result.as_deref(), Some("abc-suffix"));
    }

    #[test]
    fn test_numeric_result() {
        let engine = ScriptEngine::new();
        assert_eq!(
            engine.eval("to_number(value) * 2.0", "21").unwrap().as_deref(),
            Some("42")
        );
        assert_eq!(engine.eval("40 + 2", "").unwrap().as_deref(), Some("42"));
        assert_eq!(
            engine.eval("(to_number(value) - 32.0) * 5.0 / 9.0", "212").unwrap().as_deref(),
            Some("100")
        );
    }

    #[test]
    fn test_unit_result_is_no_value() {
        let engine = ScriptEngine::new();
        assert_eq!(engine.eval("let x = value;", "abc").unwrap(), None);
    }

    #[test]
    fn test_throw_fails() {
        let engine = ScriptEngine::new();
        let err = engine
            .eval("if value.is_empty() { throw \"empty value\" } value", "")
            .unwrap_err();
        assert!(err.to_string().contains("empty value"));
        assert!(engine.eval("to_number(value)", "abc").is_err());
    }

    #[test]
    fn test_runaway_script_stopped() {
        let engine = ScriptEngine::new();
        assert!(engine.eval("loop { }", "").is_err());
    }

    #[test]
    fn test_caching() {
        let engine = ScriptEngine::new();
        engine.compile("value").unwrap();
        engine.compile("value").unwrap();
        assert_eq!(engine.cache().read().unwrap().len(), 1);
    }

    #[test]
    fn test_validation() {
        let engine = ScriptEngine::new();
        assert!(engine.validate("value + \"x\"").is_ok());
        assert!(engine.validate("value + ").is_err());
    }
}
