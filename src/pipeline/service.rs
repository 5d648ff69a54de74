//! Manager event loop and pipeline wiring.
//!
//! [`ManagerService`] owns the [`Manager`] on a dedicated thread and feeds it
//! from the inbound channel. The receive wait is bounded by
//! `manager_delay`, so forced flushing, configuration sync and statistics run
//! even when no messages arrive.
//!
//! [`Preprocessing`] starts a complete pipeline: the manager thread plus a
//! worker pool sharing one task channel.

use super::bridge::{manager_channel, ManagerMessage, PreprocessingClient};
use super::manager::Manager;
use super::sink::Sink;
use crate::backend::{StepExecutor, WorkerPool};
use crate::config::{ConfigSource, PreprocConfig};
use crate::error::{PreprocError, Result, ResultExt};
use crate::protocol;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Runs the manager loop.
pub struct ManagerService {
    manager: Manager,
    rx: Receiver<ManagerMessage>,
    last_flush: Instant,
    last_sync: Instant,
    last_stat: Instant,
    idle: Duration,
}

impl ManagerService {
    pub fn new(manager: Manager, rx: Receiver<ManagerMessage>) -> Self {
        let now = Instant::now();
        Self {
            manager,
            rx,
            last_flush: now,
            last_sync: now,
            last_stat: now,
            idle: Duration::ZERO,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Run until shutdown or a fatal protocol fault.
    pub fn run(mut self) -> Result<()> {
        tracing::info!(
            "Preprocessing manager started with {} workers",
            self.manager.config().workers
        );
        self.manager.sync_config();

        let delay = self.manager.config().manager_delay();
        loop {
            let wait = Instant::now();
            let received = self.rx.recv_timeout(delay);
            self.idle += wait.elapsed();

            match received {
                Ok(ManagerMessage::Shutdown) => {
                    tracing::info!("Preprocessing manager shutting down");
                    break;
                }
                Ok(message) => {
                    if let Err(e) = self.handle_message(message) {
                        if e.is_fatal() {
                            tracing::error!("Preprocessing manager stopped: {}", e);
                            return Err(e);
                        }
                        tracing::warn!("{}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("All preprocessing clients gone, stopping manager");
                    break;
                }
            }

            self.periodic();
        }

        self.manager.flush();
        self.manager.flush_sink();
        Ok(())
    }

    /// Dispatch one inbound message
    pub fn handle_message(&mut self, message: ManagerMessage) -> Result<()> {
        match message {
            ManagerMessage::Register(message) => {
                let token = protocol::unpack_register(&message).context("worker registration")?;
                self.manager.register_worker(token)?;
            }
            ManagerMessage::Ingest(message) => {
                self.manager.ingest(&message)?;
            }
            ManagerMessage::Result { worker, message } => {
                self.manager.apply_result(worker, &message)?;
            }
            ManagerMessage::QueueSize { reply } => {
                let size = protocol::pack_queue_size(self.manager.queue_size());
                if reply.send(size).is_err() {
                    tracing::debug!("Queue size requester went away");
                }
            }
            ManagerMessage::Test { message, reply } => {
                self.manager.test_request(message, reply)?;
            }
            ManagerMessage::WorkerExit => {
                self.manager.worker_exited();
            }
            ManagerMessage::WorkerFailed(reason) => {
                return Err(PreprocError::Worker(reason));
            }
            ManagerMessage::Shutdown => {}
        }
        Ok(())
    }

    fn periodic(&mut self) {
        let config = self.manager.config().clone();

        if self.last_sync.elapsed() >= config.config_sync_interval() {
            self.manager.sync_config();
            self.last_sync = Instant::now();
        }

        // commit when nothing is in flight, or at least every flush interval
        if self.manager.preprocessing() == 0
            || self.last_flush.elapsed() >= config.flush_interval()
        {
            self.manager.flush();
            self.manager.flush_sink();
            self.last_flush = Instant::now();
        }

        let elapsed = self.last_stat.elapsed();
        if elapsed >= config.stat_interval() {
            let stats = self.manager.stats();
            let processed = self.manager.take_processed();
            tracing::info!(
                "Preprocessing: queued {}, processed {} values, idle {:.6} sec during {:.6} sec, {}/{} workers busy",
                stats.queued,
                processed,
                self.idle.as_secs_f64(),
                elapsed.as_secs_f64(),
                stats.busy_workers,
                stats.workers
            );
            self.idle = Duration::ZERO;
            self.last_stat = Instant::now();
        }
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name("preproc-manager".to_string())
            .spawn(move || self.run())
            .map_err(|e| PreprocError::Io(e).with_context("Failed to spawn manager thread"))
    }
}

/// Token identifying the workers of one pipeline instance
fn pool_token() -> u64 {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    nanos ^ ((std::process::id() as u64) << 32)
}

/// A running pipeline: manager thread plus worker pool.
pub struct Preprocessing {
    client: PreprocessingClient,
    manager: JoinHandle<Result<()>>,
    pool: WorkerPool,
}

impl Preprocessing {
    /// Start the manager and `config.workers` workers.
    pub fn start(
        config: PreprocConfig,
        source: Box<dyn ConfigSource>,
        sink: Box<dyn Sink>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let token = pool_token();
        let (tx, rx) = manager_channel();
        let (task_tx, task_rx) = unbounded();

        let manager = Manager::new(config.clone(), source, sink, task_tx, token);
        let manager = ManagerService::new(manager, rx).spawn()?;
        let pool = WorkerPool::spawn(&config, token, task_rx, tx.clone(), executor)?;

        Ok(Self {
            client: PreprocessingClient::new(tx, config.test_timeout()),
            manager,
            pool,
        })
    }

    pub fn client(&self) -> PreprocessingClient {
        self.client.clone()
    }

    /// Stop the manager, then wait for the workers to leave.
    pub fn shutdown(self) -> Result<()> {
        self.client.shutdown();
        let result = self
            .manager
            .join()
            .map_err(|_| PreprocError::Channel("manager thread panicked".to_string()))?;
        self.pool.join();
        result
    }
}
