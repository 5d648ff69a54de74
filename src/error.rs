//! Error handling for the preprocessing pipeline
//!
//! This module defines the crate error type, the wire decoding error and a
//! Result alias used throughout the manager, worker and configuration code.
//!
//! Per-value failures (a step rejecting its input, a result that cannot be
//! coerced to the item's value type) are never surfaced as `Err`: they travel
//! inside result messages and end up as item state. Only transport faults
//! ([`PreprocError::Protocol`]) stop the manager loop.

use thiserror::Error;

/// Errors raised while decoding a wire message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than the field requires
    #[error("message truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Unknown variant discriminant
    #[error("unknown variant type {0}")]
    UnknownVariant(u8),

    /// Unknown preprocessing step type code
    #[error("unknown step type {0}")]
    UnknownStepType(u8),

    /// Unknown failure-handling code
    #[error("unknown error handler {0}")]
    UnknownErrorHandler(u8),

    /// Unknown item value type code
    #[error("unknown value type {0}")]
    UnknownValueType(u8),

    /// Unknown item state code
    #[error("unknown item state {0}")]
    UnknownItemState(u8),

    /// A list carried a negative element count
    #[error("invalid element count {0}")]
    InvalidCount(i32),

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A string field missed its terminating zero byte
    #[error("string field is not zero terminated")]
    MissingTerminator,

    /// Bytes left over after a complete message was decoded
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The frame carried a message code this endpoint does not accept
    #[error("unexpected message code {0}")]
    UnexpectedCode(u32),
}

/// Main error type for preprocessing operations
#[derive(Error, Debug)]
pub enum PreprocError {
    /// Malformed or truncated wire data, fatal to the receiving side
    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// A worker broke the manager/worker exchange (unexpected result,
    /// registration beyond pool capacity)
    #[error("Worker protocol error: {0}")]
    Worker(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Errors related to Rhai script execution
    #[error("Script error: {0}")]
    Script(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PreprocError>,
    },
}

impl PreprocError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PreprocError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        PreprocError::Script(err.to_string())
    }

    /// Whether this error must terminate the receiving loop
    pub fn is_fatal(&self) -> bool {
        match self {
            PreprocError::Protocol(_) | PreprocError::Worker(_) => true,
            PreprocError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for preprocessing operations
pub type Result<T> = std::result::Result<T, PreprocError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, DecodeError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PreprocError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PreprocError::from(e).with_context(f()))
    }
}
