//! Worker side of the preprocessing pipeline
//!
//! Workers run step chains. They hold no item state of their own: every task
//! carries the value, the item's steps and the history the stateful steps
//! need, and every reply carries the new history back to the manager.
//!
//! # Components
//!
//! - [`WorkerPool`] - Spawns the worker threads and stops them on shutdown
//! - [`PreprocWorker`] - Worker loop: register, then answer tasks
//! - [`StepChain`] - Runs a chain of steps, applies error handlers, formats
//!   diagnostics
//! - [`StepExecutor`] - The seam for step implementations
//! - [`BuiltinStepExecutor`] - The built-in step set, with Rhai for scripts
//!
//! # Example
//!
//! ```ignore
//! use preproc_rs::backend::{BuiltinStepExecutor, StepChain};
//! use std::sync::Arc;
//!
//! let chain = StepChain::new(Arc::new(BuiltinStepExecutor::new()));
//! let result = chain.execute(&task);
//! ```

pub mod preprocessor;
pub mod step_executor;
pub mod steps;
pub mod worker;

pub use preprocessor::StepChain;
pub use step_executor::{StepExecutor, StepOutcome};
pub use steps::BuiltinStepExecutor;
pub use worker::PreprocWorker;

use crate::config::PreprocConfig;
use crate::error::{PreprocError, Result};
use crate::pipeline::{ManagerMessage, TaskEnvelope};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A fixed set of worker threads sharing one task channel
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers. Each registers itself with the
    /// manager using `pool_token` before taking tasks.
    pub fn spawn(
        config: &PreprocConfig,
        pool_token: u64,
        tasks: Receiver<TaskEnvelope>,
        manager: Sender<ManagerMessage>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let chain = StepChain::new(executor)
            .with_limits(config.max_error_len, config.value_preview_len);

        let mut pool = Self {
            handles: Vec::with_capacity(config.workers),
            running,
        };

        for index in 0..config.workers {
            let worker = PreprocWorker::new(
                index,
                pool_token,
                chain.clone(),
                tasks.clone(),
                manager.clone(),
                pool.running.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("preproc-worker-{}", index))
                .spawn(move || worker.run())
                .map_err(|e| {
                    PreprocError::Io(e).with_context("Failed to spawn worker thread")
                })?;
            pool.handles.push(handle);
        }

        tracing::info!(workers = pool.handles.len(), "Worker pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ask every worker to stop after its current task
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the workers and wait for them to leave
    pub fn join(mut self) {
        self.stop();
        for handle in std::mem::take(&mut self.handles) {
            if handle.join().is_err() {
                tracing::error!("Preprocessing worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
