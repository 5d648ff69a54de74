//! Downstream consumers of preprocessed values.

use crate::types::ItemValue;
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};

/// Which consumer a flushed value was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Regular value storage
    Value,
    /// Low-level discovery processing
    Discovery,
}

/// A flushed value with its routing
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub kind: SinkKind,
    pub value: ItemValue,
}

/// Final destination of values leaving the pipeline.
///
/// Values are delivered in arrival order. `flush` marks a point where the
/// sink may commit what it has buffered.
pub trait Sink: Send {
    fn accept(&mut self, value: ItemValue);

    fn accept_discovery(&mut self, value: ItemValue);

    fn flush(&mut self) {}
}

/// Forwards every record over a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SinkRecord>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SinkRecord>) -> Self {
        Self { tx }
    }

    fn send(&self, kind: SinkKind, value: ItemValue) {
        if self.tx.send(SinkRecord { kind, value }).is_err() {
            tracing::warn!("Sink receiver dropped, discarding value");
        }
    }
}

impl Sink for ChannelSink {
    fn accept(&mut self, value: ItemValue) {
        self.send(SinkKind::Value, value);
    }

    fn accept_discovery(&mut self, value: ItemValue) {
        self.send(SinkKind::Discovery, value);
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<SinkRecord>,
    flushes: usize,
}

/// Keeps records in memory; clones share the same storage
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.lock().records.clone()
    }

    /// Take the records delivered so far
    pub fn drain(&self) -> Vec<SinkRecord> {
        std::mem::take(&mut self.lock().records)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }
}

impl Sink for MemorySink {
    fn accept(&mut self, value: ItemValue) {
        self.lock().records.push(SinkRecord {
            kind: SinkKind::Value,
            value,
        });
    }

    fn accept_discovery(&mut self, value: ItemValue) {
        self.lock().records.push(SinkRecord {
            kind: SinkKind::Discovery,
            value,
        });
    }

    fn flush(&mut self) {
        self.lock().flushes += 1;
    }
}
