//! Preprocessing Worker Thread Implementation
//!
//! A worker registers with the manager, then pulls tasks from the shared
//! task channel until the channel closes or the pool stops it. Each task is
//! one step chain (production or test mode); the reply is sent back tagged
//! with the manager-side slot the task was addressed to.
//!
//! # Failure handling
//!
//! A task that cannot be decoded means the two sides disagree on the wire
//! format. The worker reports it with [`ManagerMessage::WorkerFailed`], which
//! the manager treats as fatal, and leaves its loop.

use super::preprocessor::StepChain;
use crate::error::DecodeError;
use crate::pipeline::{ManagerMessage, TaskEnvelope};
use crate::protocol::{self, Message, MessageCode, TaskRequest, TestRequest};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often an idle worker checks whether it should stop
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One preprocessing worker
pub struct PreprocWorker {
    index: usize,
    pool_token: u64,
    chain: StepChain,
    tasks: Receiver<TaskEnvelope>,
    manager: Sender<ManagerMessage>,
    running: Arc<AtomicBool>,
    processed: u64,
}

impl PreprocWorker {
    pub fn new(
        index: usize,
        pool_token: u64,
        chain: StepChain,
        tasks: Receiver<TaskEnvelope>,
        manager: Sender<ManagerMessage>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            pool_token,
            chain,
            tasks,
            manager,
            running,
            processed: 0,
        }
    }

    /// Number of tasks this worker has answered
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Main worker loop
    pub fn run(mut self) {
        tracing::info!(worker = self.index, "Preprocessing worker started");

        if self
            .manager
            .send(ManagerMessage::Register(protocol::pack_register(self.pool_token)))
            .is_err()
        {
            tracing::warn!(worker = self.index, "Manager gone before registration");
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            let envelope = match self.tasks.recv_timeout(IDLE_POLL) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let reply = match self.process(&envelope.message) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(worker = self.index, "Cannot decode task: {}", e);
                    let _ = self
                        .manager
                        .send(ManagerMessage::WorkerFailed(e.to_string()));
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            };

            self.processed += 1;
            let result = ManagerMessage::Result {
                worker: envelope.worker,
                message: reply,
            };
            if self.manager.send(result).is_err() {
                break;
            }
        }

        let _ = self.manager.send(ManagerMessage::WorkerExit);
        tracing::info!(
            worker = self.index,
            processed = self.processed,
            "Preprocessing worker stopped"
        );
    }

    /// Run one task and build the reply message
    pub fn process(&self, message: &Message) -> Result<Message, DecodeError> {
        match message.code {
            MessageCode::Request => {
                let task = TaskRequest::decode(message)?;
                tracing::trace!(
                    worker = self.index,
                    itemid = task.itemid,
                    steps = task.steps.len(),
                    "Processing value"
                );
                Ok(self.chain.execute(&task).encode())
            }
            MessageCode::TestRequest => {
                let request = TestRequest::decode(message)?;
                Ok(self.chain.execute_test(&request).encode())
            }
            other => Err(DecodeError::UnexpectedCode(other as u32)),
        }
    }
}
