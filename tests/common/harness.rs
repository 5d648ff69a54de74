//! Single-threaded manager harness
//!
//! Drives a [`Manager`] directly and plays the worker pool by hand, so tests
//! control exactly when each task completes.

use crossbeam_channel::{unbounded, Receiver};
use preproc_rs::backend::{BuiltinStepExecutor, StepChain};
use preproc_rs::config::{ItemConfig, PreprocConfig, StaticConfigSource};
use preproc_rs::pipeline::{Manager, MemorySink, TaskEnvelope};
use preproc_rs::protocol::{pack_item_values, TaskRequest};
use preproc_rs::types::ItemValue;
use std::sync::Arc;

pub const POOL_TOKEN: u64 = 0x5eed;

pub struct Harness {
    pub manager: Manager,
    pub tasks: Receiver<TaskEnvelope>,
    pub sink: MemorySink,
    pub source: StaticConfigSource,
    pub chain: StepChain,
}

impl Harness {
    pub fn new(workers: usize, items: Vec<ItemConfig>) -> Self {
        Self::with_config(
            PreprocConfig {
                workers,
                ..Default::default()
            },
            items,
        )
    }

    pub fn with_config(config: PreprocConfig, items: Vec<ItemConfig>) -> Self {
        let source = StaticConfigSource::from_items(items);
        let sink = MemorySink::new();
        let (tx, rx) = unbounded();
        let chain = StepChain::new(Arc::new(BuiltinStepExecutor::new()))
            .with_limits(config.max_error_len, config.value_preview_len);
        let workers = config.workers;

        let mut manager = Manager::new(
            config,
            Box::new(source.clone()),
            Box::new(sink.clone()),
            tx,
            POOL_TOKEN,
        );
        for _ in 0..workers {
            manager
                .register_worker(POOL_TOKEN)
                .expect("registration within pool size");
        }

        Self {
            manager,
            tasks: rx,
            sink,
            source,
            chain,
        }
    }

    pub fn ingest(&mut self, values: &[ItemValue]) {
        self.manager
            .ingest(&pack_item_values(values))
            .expect("ingest batch");
    }

    /// Take the next dispatched task without answering it
    pub fn next_task(&self) -> Option<TaskEnvelope> {
        self.tasks.try_recv().ok()
    }

    /// Run a dispatched task through the step chain and hand the result back
    pub fn complete(&mut self, envelope: TaskEnvelope) {
        let task = TaskRequest::decode(&envelope.message).expect("task request");
        let result = self.chain.execute(&task).encode();
        self.manager
            .apply_result(envelope.worker, &result)
            .expect("apply result");
    }

    /// Answer dispatched tasks until none are left
    pub fn run_all(&mut self) {
        while let Some(envelope) = self.next_task() {
            self.complete(envelope);
        }
    }
}
