//! Thread boundary between collectors, the manager and the workers.
//!
//! Everything that reaches the manager arrives as a [`ManagerMessage`] on a
//! single inbound channel. Workers share one task channel and receive
//! [`TaskEnvelope`]s tagged with the slot the manager assigned the task to.

use crate::error::{PreprocError, Result};
use crate::pipeline::id::WorkerId;
use crate::protocol::{
    self, pack_item_value_into, Message, MessageCode, TestRequest, TestResult, WireWriter,
};
use crate::types::ItemValue;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// Messages handled by the manager loop.
#[derive(Debug, Clone)]
pub enum ManagerMessage {
    /// A worker announces itself with a `Register` message.
    Register(Message),

    /// A batch of collected values (`Request` message).
    Ingest(Message),

    /// A worker finished the task of its slot.
    Result { worker: WorkerId, message: Message },

    /// Queue size query, answered with a `QueueSize` message.
    QueueSize { reply: Sender<Message> },

    /// Test-mode request, answered with the worker's `TestResult` message.
    Test {
        message: Message,
        reply: Sender<Message>,
    },

    /// A worker thread left its loop.
    WorkerExit,

    /// A worker received data it could not decode.
    WorkerFailed(String),

    /// Stop the manager loop.
    Shutdown,
}

/// A task for the worker pool, addressed to a manager-side slot.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub worker: WorkerId,
    pub message: Message,
}

/// Channel capacity for messages into the manager.
pub const MANAGER_CHANNEL_CAPACITY: usize = 10_000;

/// Create the manager's inbound channel.
pub fn manager_channel() -> (Sender<ManagerMessage>, Receiver<ManagerMessage>) {
    bounded(MANAGER_CHANNEL_CAPACITY)
}

/// Collector-side handle to a running manager.
#[derive(Debug, Clone)]
pub struct PreprocessingClient {
    tx: Sender<ManagerMessage>,
    test_timeout: Duration,
}

impl PreprocessingClient {
    pub fn new(tx: Sender<ManagerMessage>, test_timeout: Duration) -> Self {
        Self { tx, test_timeout }
    }

    fn send(&self, message: ManagerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| PreprocError::Channel("preprocessing manager is not running".to_string()))
    }

    /// Submit values in a single ingest message.
    pub fn ingest(&self, values: &[ItemValue]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.send(ManagerMessage::Ingest(protocol::pack_item_values(values)))
    }

    /// Submit an already packed ingest message.
    pub fn ingest_message(&self, message: Message) -> Result<()> {
        message.expect(MessageCode::Request)?;
        self.send(ManagerMessage::Ingest(message))
    }

    /// Number of values the manager has not flushed yet.
    pub fn queue_size(&self) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.send(ManagerMessage::QueueSize { reply })?;
        let message = rx
            .recv()
            .map_err(|_| PreprocError::Channel("queue size reply dropped".to_string()))?;
        Ok(protocol::unpack_queue_size(&message)?)
    }

    /// Block until every submitted value has been flushed.
    pub fn wait_idle(&self, poll: Duration, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.queue_size()? == 0 {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(PreprocError::Timeout(
                    "preprocessing queue did not drain".to_string(),
                ));
            }
            std::thread::sleep(poll);
        }
    }

    /// Run a step chain in test mode and wait for the outcome.
    pub fn test(&self, request: &TestRequest) -> Result<TestResult> {
        let (reply, rx) = bounded(1);
        self.send(ManagerMessage::Test {
            message: request.encode(),
            reply,
        })?;
        let message = rx.recv_timeout(self.test_timeout).map_err(|_| {
            PreprocError::Timeout(format!(
                "no test result within {}s",
                self.test_timeout.as_secs()
            ))
        })?;
        Ok(TestResult::decode(&message)?)
    }

    /// Ask the manager loop to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ManagerMessage::Shutdown);
    }
}

/// Accumulates values and sends one ingest message per full batch.
pub struct ValueBatcher {
    client: PreprocessingClient,
    writer: WireWriter,
    count: usize,
    batch_size: usize,
}

impl ValueBatcher {
    pub fn new(client: PreprocessingClient, batch_size: usize) -> Self {
        Self {
            client,
            writer: WireWriter::new(),
            count: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a value, sending the batch once it is full.
    pub fn push(&mut self, value: &ItemValue) -> Result<()> {
        pack_item_value_into(&mut self.writer, value);
        self.count += 1;
        if self.count >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Send whatever is buffered.
    pub fn flush(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let writer = std::mem::replace(&mut self.writer, WireWriter::new());
        self.count = 0;
        self.client
            .send(ManagerMessage::Ingest(Message::new(
                MessageCode::Request,
                writer.finish(),
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    fn client() -> (PreprocessingClient, Receiver<ManagerMessage>) {
        let (tx, rx) = manager_channel();
        (PreprocessingClient::new(tx, Duration::from_millis(50)), rx)
    }

    fn ingested(rx: &Receiver<ManagerMessage>) -> Vec<Vec<ItemValue>> {
        rx.try_iter()
            .filter_map(|m| match m {
                ManagerMessage::Ingest(msg) => Some(protocol::unpack_item_values(&msg).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_batcher_sends_full_batches() {
        let (client, rx) = client();
        let mut batcher = ValueBatcher::new(client, 2);
        for id in 1..=5 {
            batcher.push(&ItemValue::new(id, ValueType::Uint64, id)).unwrap();
        }
        assert_eq!(batcher.len(), 1);
        batcher.flush().unwrap();
        assert!(batcher.is_empty());

        let batches = ingested(&rx);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2][0].itemid, 5);
    }

    #[test]
    fn test_empty_ingest_sends_nothing() {
        let (client, rx) = client();
        client.ingest(&[]).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_size_roundtrip() {
        let (client, rx) = client();
        let handle = std::thread::spawn(move || match rx.recv().unwrap() {
            ManagerMessage::QueueSize { reply } => {
                reply.send(protocol::pack_queue_size(7)).unwrap();
            }
            other => panic!("unexpected message {:?}", other),
        });
        assert_eq!(client.queue_size().unwrap(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_test_request_times_out() {
        let (client, _rx) = client();
        let request = TestRequest {
            value_type: ValueType::Str,
            value: "x".into(),
            ts: Default::default(),
            history: Vec::new(),
            steps: Vec::new(),
        };
        let err = client.test(&request).unwrap_err();
        assert!(matches!(err, PreprocError::Timeout(_)));
    }

    #[test]
    fn test_send_after_manager_gone() {
        let (client, rx) = client();
        drop(rx);
        assert!(matches!(
            client.ingest(&[ItemValue::new(1, ValueType::Str, "a")]),
            Err(PreprocError::Channel(_))
        ));
    }
}
