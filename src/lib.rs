//! # preproc-rs: Metric Value Preprocessing Pipeline
//!
//! Collected item values are transformed by per-item chains of steps
//! (multipliers, trims, regex and JSON extraction, deltas, throttling,
//! scripts) before they are stored. Values leave the pipeline in the order
//! they arrived, even though their chains run concurrently.
//!
//! ## Architecture
//!
//! - **Pipeline**: A single manager thread owns the ordered queue, the
//!   per-item history cache and the item configuration cache
//! - **Backend**: A pool of worker threads runs step chains and reports
//!   results and new history back to the manager
//! - **Protocol**: Every exchange is a binary message with a fixed field
//!   order, packed in one streaming pass
//! - **Scripting**: Rhai powers the `Script` step
//!
//! ## Configuration
//!
//! The service reads `preprocd.toml` from the platform configuration
//! directory under `dev.hxyulin.preproc-rs`, or from an explicit path.
//!
//! ## Example
//!
//! ```ignore
//! use preproc_rs::{
//!     backend::BuiltinStepExecutor,
//!     config::{ItemConfig, PreprocConfig, StaticConfigSource},
//!     pipeline::{MemorySink, Preprocessing},
//!     types::{ItemValue, Step, StepType, ValueType},
//! };
//! use std::sync::Arc;
//!
//! let items = StaticConfigSource::from_items([ItemConfig::new(1, ValueType::Float)
//!     .with_steps(vec![Step::new(StepType::Multiplier, "2")])]);
//! let sink = MemorySink::new();
//!
//! let pipeline = Preprocessing::start(
//!     PreprocConfig::default(),
//!     Box::new(items),
//!     Box::new(sink.clone()),
//!     Arc::new(BuiltinStepExecutor::new()),
//! )?;
//!
//! pipeline.client().ingest(&[ItemValue::new(1, ValueType::Float, "21")])?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod scripting;
pub mod types;
pub mod variant;

// Re-export commonly used types
pub use backend::{BuiltinStepExecutor, StepChain, StepExecutor, StepOutcome, WorkerPool};
pub use config::{AppConfig, ConfigSource, ItemConfig, PreprocConfig, StaticConfigSource};
pub use error::{DecodeError, PreprocError, Result};
pub use pipeline::{Manager, Preprocessing, PreprocessingClient, Sink};
pub use types::{ErrorHandler, ItemValue, Step, StepType, ValueType};
pub use variant::Variant;
