//! Rhai scripting for the `Script` preprocessing step
//!
//! A script step receives the current value as the string variable `value`
//! and returns the new value. Strings are returned as is, numbers are
//! formatted, `()` means "no value".
//!
//! ## Helper Functions
//!
//! - `to_number(text)` - Parse text as a number, failing the step otherwise
//! - `abs`, `sqrt`, `pow`, `floor`, `ceil`, `round`, `min`, `max`, `clamp`,
//!   `ln`, `log10` - Math on floats
//!
//! Throwing from a script (`throw "text"`) fails the step with that text.
//!
//! ## Example Scripts
//!
//! Convert a Fahrenheit reading to Celsius:
//! ```rhai
//! (to_number(value) - 32.0) * 5.0 / 9.0
//! ```
//!
//! Reject empty input:
//! ```rhai
//! if value.is_empty() { throw "empty value" }
//! value.to_upper()
//! ```

mod engine;

pub use engine::ScriptEngine;

use crate::error::{PreprocError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled script that can be executed repeatedly
#[derive(Clone)]
pub struct CompiledScript {
    ast: AST,
    source: String,
}

impl CompiledScript {
    /// Source code of this script
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("source", &self.source)
            .finish()
    }
}

/// Scripts kept compiled before older ones are evicted
pub const MAX_CACHED_SCRIPTS: usize = 256;

/// Compiled scripts keyed by source, so repeated steps parse only once.
///
/// Holds at most `capacity` scripts; inserting into a full cache evicts an
/// arbitrary entry.
pub struct ScriptCache {
    cache: HashMap<String, CompiledScript>,
    capacity: usize,
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::with_capacity(MAX_CACHED_SCRIPTS)
    }
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Get a cached script or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, source: &str) -> Result<CompiledScript> {
        if let Some(script) = self.cache.get(source) {
            return Ok(script.clone());
        }

        let ast = engine
            .compile(source)
            .map_err(|e| PreprocError::Script(format!("Compilation error: {}", e)))?;

        let script = CompiledScript {
            ast,
            source: source.to_string(),
        };
        if self.cache.len() >= self.capacity {
            if let Some(victim) = self.cache.keys().next().cloned() {
                self.cache.remove(&victim);
            }
        }
        self.cache.insert(source.to_string(), script.clone());
        Ok(script)
    }

    pub fn get(&self, source: &str) -> Option<CompiledScript> {
        self.cache.get(source).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Thread-safe script cache shared by all workers
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;

pub fn create_shared_cache() -> SharedScriptCache {
    Arc::new(RwLock::new(ScriptCache::new()))
}
