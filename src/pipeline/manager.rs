//! Preprocessing manager
//!
//! The manager is the single owner of the work queue, the item configuration
//! snapshot, the history cache and the worker registry. Everything that
//! mutates those structures happens here, on one thread, so ordering rules
//! are enforced by bookkeeping rather than locks.
//!
//! # Request lifecycle
//!
//! ```text
//! enqueue ──► Queued ──► Processing ──► Done ──► flush (sink)
//!               ▲
//!   Pending ────┘  (released when the previous request of the item is Done)
//! ```
//!
//! # Ordering
//!
//! - Values leave through [`Manager::flush`] only from the queue head, so the
//!   sink sees arrival order no matter in which order workers finish.
//! - Items with delta or throttle steps are chained through the linked item
//!   index: a new request waits as `Pending` until the previous one of the
//!   same item is `Done`, and only then can see its history.
//! - Internal items are kept in a priority segment at the head of the queue,
//!   in arrival order among themselves.
//! - Dependent item values are inserted directly behind their master.

use super::bridge::TaskEnvelope;
use super::history::HistoryCache;
use super::id::{NodeHandle, WorkerId};
use super::item_cache::ItemConfigCache;
use super::queue::{OrderedQueue, QueueCursor};
use super::sink::Sink;
use crate::config::{ConfigSource, PreprocConfig};
use crate::error::{PreprocError, Result, ResultExt};
use crate::protocol::{self, Message, MessageCode, TaskRequest, TaskResult};
use crate::types::{truncate_error, ItemKind, ItemState, ItemValue, Step, ValueType};
use crate::variant::Variant;
use crossbeam_channel::Sender;
use std::collections::{HashMap, VecDeque};

/// Processing state of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for a free worker
    Queued,
    /// Owned by a worker
    Processing,
    /// Finished, waiting to be flushed
    Done,
    /// Blocked behind an earlier request of the same item
    Pending,
}

/// One in-flight value
#[derive(Debug, Clone)]
pub struct Request {
    pub state: RequestState,
    /// Request of the same item released when this one is done
    pub pending: Option<NodeHandle>,
    pub value: ItemValue,
    pub value_type: ValueType,
    /// Steps to run, moved into the task when dispatched
    pub steps: Vec<Step>,
}

/// Where a new request goes in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Collected value: internal items join the priority segment
    Arrival,
    /// Dependent value: behind the master, or at the tail without one
    After(Option<NodeHandle>),
}

/// What a busy worker is doing
#[derive(Debug)]
enum WorkerTask {
    Value(NodeHandle),
    Test(Sender<Message>),
}

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    task: Option<WorkerTask>,
}

/// A test-mode request waiting for a worker
#[derive(Debug)]
struct DirectRequest {
    message: Message,
    reply: Sender<Message>,
}

/// Counters reported by the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Values not yet flushed
    pub queued: u64,
    /// Values delivered to the sink since the last reset
    pub processed: u64,
    /// Values waiting for or undergoing step execution
    pub preprocessing: u64,
    /// Registered workers
    pub workers: usize,
    /// Workers currently owning a task
    pub busy_workers: usize,
}

/// The coordinating half of the pipeline
pub struct Manager {
    config: PreprocConfig,
    source: Box<dyn ConfigSource>,
    sink: Box<dyn Sink>,
    task_tx: Sender<TaskEnvelope>,
    pool_token: u64,

    queue: OrderedQueue<Request>,
    priority_tail: QueueCursor,
    linked_items: HashMap<u64, NodeHandle>,
    direct_queue: VecDeque<DirectRequest>,
    items: ItemConfigCache,
    history: HistoryCache,

    workers: Vec<WorkerSlot>,
    next_worker_id: u32,
    retiring: usize,

    processed_num: u64,
    preproc_num: u64,
}

impl Manager {
    /// Create a manager dispatching tasks into `task_tx`.
    ///
    /// Only workers registering with `pool_token` are accepted.
    pub fn new(
        config: PreprocConfig,
        source: Box<dyn ConfigSource>,
        sink: Box<dyn Sink>,
        task_tx: Sender<TaskEnvelope>,
        pool_token: u64,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            task_tx,
            pool_token,
            queue: OrderedQueue::new(),
            priority_tail: QueueCursor::default(),
            linked_items: HashMap::new(),
            direct_queue: VecDeque::new(),
            items: ItemConfigCache::new(),
            history: HistoryCache::new(),
            workers: Vec::new(),
            next_worker_id: 0,
            retiring: 0,
            processed_num: 0,
            preproc_num: 0,
        }
    }

    pub fn config(&self) -> &PreprocConfig {
        &self.config
    }

    /// Number of values not flushed yet
    pub fn queue_size(&self) -> u64 {
        self.queue.len() as u64
    }

    pub fn preprocessing(&self) -> u64 {
        self.preproc_num
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            queued: self.queue_size(),
            processed: self.processed_num,
            preprocessing: self.preproc_num,
            workers: self.workers.len(),
            busy_workers: self.workers.iter().filter(|w| w.task.is_some()).count(),
        }
    }

    /// Return the processed counter and reset it
    pub fn take_processed(&mut self) -> u64 {
        std::mem::take(&mut self.processed_num)
    }

    /// Current history entries of an item
    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    /// State of the request at `handle`, if still queued
    pub fn request(&self, handle: NodeHandle) -> Option<&Request> {
        self.queue.get(handle)
    }

    /// Queued requests in queue order
    pub fn requests(&self) -> impl Iterator<Item = (NodeHandle, &Request)> {
        self.queue.iter()
    }

    // ==================== Workers ====================

    /// Register a worker of this pool.
    ///
    /// Foreign tokens are rejected without failing the manager. Registering
    /// more workers than configured is a protocol fault.
    pub fn register_worker(&mut self, pool_token: u64) -> Result<Option<WorkerId>> {
        if pool_token != self.pool_token {
            tracing::warn!(
                "Rejected worker registration with unknown pool token {:#x}",
                pool_token
            );
            return Ok(None);
        }
        if self.workers.len() >= self.config.workers {
            return Err(PreprocError::Worker(format!(
                "worker registration exceeds pool size {}",
                self.config.workers
            )));
        }

        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.workers.push(WorkerSlot { id, task: None });
        tracing::debug!("Registered preprocessing worker {}", id);

        self.assign_tasks()?;
        Ok(Some(id))
    }

    /// Drop one worker slot after a worker went away.
    ///
    /// An idle slot is removed right away, otherwise the next slot to finish
    /// its task is retired.
    pub fn worker_exited(&mut self) {
        match self.workers.iter().position(|w| w.task.is_none()) {
            Some(pos) => {
                let slot = self.workers.remove(pos);
                tracing::info!("Preprocessing worker {} disconnected", slot.id);
            }
            None => {
                self.retiring += 1;
                tracing::info!("Preprocessing worker disconnected, retiring next busy slot");
            }
        }
    }

    fn free_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| w.task.is_none())
    }

    fn release_worker(&mut self, pos: usize) {
        if self.retiring > 0 {
            let slot = self.workers.remove(pos);
            self.retiring -= 1;
            tracing::debug!("Retired preprocessing worker slot {}", slot.id);
        }
    }

    // ==================== Configuration ====================

    /// Refresh the item configuration and purge history that no longer
    /// applies: items removed from configuration or changed since the
    /// previous snapshot.
    pub fn sync_config(&mut self) {
        let Some(change) = self.items.refresh(self.source.as_ref()) else {
            return;
        };

        let items = &self.items;
        let purged = self
            .history
            .retain(|itemid| items.history_valid(itemid, change.old_revision));
        if purged > 0 {
            tracing::debug!("Purged history of {} items", purged);
        }
    }

    // ==================== Ingestion ====================

    /// Accept a batch of collected values
    pub fn ingest(&mut self, message: &Message) -> Result<()> {
        let values = protocol::unpack_item_values(message).context("ingest batch")?;

        self.sync_config();
        for value in values {
            self.enqueue(value, None)?;
        }
        self.assign_tasks()?;
        self.flush();
        Ok(())
    }

    /// Queue one value.
    ///
    /// `master` is the request a dependent value must follow; without one
    /// the value is placed by arrival, internal items ahead of the rest.
    pub fn enqueue(&mut self, value: ItemValue, master: Option<NodeHandle>) -> Result<()> {
        let placement = match master {
            Some(handle) => Placement::After(Some(handle)),
            None => Placement::Arrival,
        };
        self.enqueue_at(value, placement)
    }

    fn enqueue_at(&mut self, value: ItemValue, placement: Placement) -> Result<()> {
        tracing::trace!("enqueue itemid {}", value.itemid);

        let item = self.items.get(value.itemid);
        let priority = item.is_some_and(|i| i.kind == ItemKind::Internal);

        let done = match item {
            None => true,
            Some(item) if item.steps.is_empty() => true,
            Some(_) => value.state != ItemState::NotSupported && !value.has_value(),
        };

        if done && self.queue.is_empty() {
            // nothing ahead of it, deliver right away
            self.deliver(value.clone());
            self.processed_num += 1;
            return self.enqueue_dependent(&value, None);
        }

        let (state, value_type, steps, order_sensitive) = match item {
            Some(item) if !done => {
                let steps = if value.state != ItemState::NotSupported {
                    self.preproc_num += 1;
                    item.steps.clone()
                } else {
                    Vec::new()
                };
                (
                    RequestState::Queued,
                    item.value_type,
                    steps,
                    item.is_order_sensitive(),
                )
            }
            _ => (RequestState::Done, value.value_type, Vec::new(), false),
        };

        let request = Request {
            state,
            pending: None,
            value,
            value_type,
            steps,
        };

        let master = match placement {
            Placement::Arrival => None,
            Placement::After(master) => master,
        };
        let handle = if placement == Placement::Arrival && priority {
            let handle = if self.priority_tail.is_set() {
                // behind the last internal request
                let handle = self
                    .queue
                    .insert_after(self.priority_tail.current(), request);
                self.priority_tail.update(&self.queue);
                handle
            } else {
                let handle = self.queue.prepend(request);
                self.priority_tail.init(&self.queue);
                handle
            };
            self.priority_tail.advance(&self.queue);
            handle
        } else {
            let handle = self.queue.insert_after(master, request);
            self.priority_tail.update(&self.queue);
            if master.is_some() && master == self.priority_tail.current() {
                self.priority_tail.advance(&self.queue);
            }
            handle
        };

        match state {
            RequestState::Queued if order_sensitive => {
                self.link_items(handle);
                Ok(())
            }
            RequestState::Done => {
                let value = self.queue.get(handle).map(|r| r.value.clone());
                match value {
                    Some(value) => self.enqueue_dependent(&value, Some(handle)),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Chain a new request of an order-sensitive item behind the previous one
    fn link_items(&mut self, handle: NodeHandle) {
        let Some(itemid) = self.queue.get(handle).map(|r| r.value.itemid) else {
            return;
        };

        if let Some(&previous) = self.linked_items.get(&itemid) {
            let blocked = match self.queue.get_mut(previous) {
                Some(prev) if prev.state != RequestState::Done => {
                    prev.pending = Some(handle);
                    true
                }
                _ => false,
            };
            if blocked {
                if let Some(request) = self.queue.get_mut(handle) {
                    request.state = RequestState::Pending;
                }
            }
        }
        self.linked_items.insert(itemid, handle);
    }

    /// Mark a request done and release whatever waited for it
    fn set_done(&mut self, handle: NodeHandle) {
        let Some(request) = self.queue.get_mut(handle) else {
            return;
        };
        request.state = RequestState::Done;
        let pending = request.pending.take();
        let itemid = request.value.itemid;

        if let Some(pending) = pending {
            if let Some(next) = self.queue.get_mut(pending) {
                next.state = RequestState::Queued;
            }
        }
        if self.linked_items.get(&itemid) == Some(&handle) {
            self.linked_items.remove(&itemid);
        }
    }

    /// Queue copies of a processed value for every dependent item.
    ///
    /// Dependents follow their master: behind its queue slot, or at the
    /// tail when the master was delivered inline. They never join the
    /// priority segment. Does not flush: the master must stay queued until
    /// all of its dependents are linked in behind it.
    fn enqueue_dependent(&mut self, value: &ItemValue, master: Option<NodeHandle>) -> Result<()> {
        if !value.has_value() {
            return Ok(());
        }
        let dependents = match self.items.get(value.itemid) {
            Some(item) if !item.dependents.is_empty() => item.dependents.clone(),
            _ => return Ok(()),
        };

        let enqueue_one = |manager: &mut Self, dep: &crate::config::DependentItem| {
            let mut copy = value.clone();
            copy.itemid = dep.itemid;
            copy.flags = dep.flags();
            if let Some(config) = manager.items.get(dep.itemid) {
                copy.value_type = config.value_type;
            }
            manager.enqueue_at(copy, Placement::After(master))
        };

        if master.is_some() {
            // each insert lands right behind the master, so go backwards
            for dep in dependents.iter().rev() {
                enqueue_one(self, dep)?;
            }
        } else {
            // appended at the tail one by one, so keep configured order
            for dep in dependents.iter() {
                enqueue_one(self, dep)?;
            }
        }
        Ok(())
    }

    // ==================== Dispatch ====================

    /// Hand queued work to free workers. Test requests go first.
    pub fn assign_tasks(&mut self) -> Result<()> {
        while let Some(pos) = self.free_worker() {
            let worker = self.workers[pos].id;

            if let Some(direct) = self.direct_queue.pop_front() {
                self.send_task(worker, direct.message)?;
                self.workers[pos].task = Some(WorkerTask::Test(direct.reply));
                continue;
            }

            let Some((handle, message)) = self.next_task() else {
                break;
            };
            self.send_task(worker, message)?;
            self.workers[pos].task = Some(WorkerTask::Value(handle));
        }
        Ok(())
    }

    /// Find the first queued request and build its task
    fn next_task(&mut self) -> Option<(NodeHandle, Message)> {
        let mut cursor = QueueCursor::new(&self.queue);

        while cursor.advance(&self.queue) {
            let handle = cursor.current()?;
            let (state, itemid, not_supported) = match self.queue.get(handle) {
                Some(r) => (r.state, r.value.itemid, r.value.state == ItemState::NotSupported),
                None => continue,
            };
            if state != RequestState::Queued {
                continue;
            }

            if not_supported {
                // item failed upstream, stateful steps must start over
                self.history.remove(itemid);
                self.set_done(handle);
                continue;
            }

            let history = self.history.get(itemid).to_vec();
            let request = self.queue.get_mut(handle)?;
            let task = TaskRequest {
                itemid,
                value_type: request.value_type,
                ts: request.value.ts,
                value: request.value.value.clone(),
                history,
                steps: std::mem::take(&mut request.steps),
            };
            request.state = RequestState::Processing;
            return Some((handle, task.encode()));
        }
        None
    }

    fn send_task(&self, worker: WorkerId, message: Message) -> Result<()> {
        self.task_tx
            .send(TaskEnvelope { worker, message })
            .map_err(|_| PreprocError::Channel("worker task channel closed".to_string()))
    }

    /// Queue a test-mode request; the reply is relayed verbatim to `reply`
    pub fn test_request(&mut self, message: Message, reply: Sender<Message>) -> Result<()> {
        message.expect(MessageCode::TestRequest).context("test request")?;
        self.direct_queue.push_back(DirectRequest { message, reply });
        self.assign_tasks()
    }

    // ==================== Results ====================

    /// Process a message returned by `worker`
    pub fn apply_result(&mut self, worker: WorkerId, message: &Message) -> Result<()> {
        let pos = self
            .workers
            .iter()
            .position(|w| w.id == worker)
            .ok_or_else(|| PreprocError::Worker(format!("result from unknown worker {}", worker)))?;

        let task = self.workers[pos].task.take().ok_or_else(|| {
            PreprocError::Worker(format!("result from idle worker {}", worker))
        })?;

        match (task, message.code) {
            (WorkerTask::Value(handle), MessageCode::Result) => {
                let result = TaskResult::decode(message)
                    .with_context(|| format!("result from worker {}", worker))?;
                self.release_worker(pos);
                self.preproc_num = self.preproc_num.saturating_sub(1);
                self.complete(handle, result)?;
            }
            (WorkerTask::Test(reply), MessageCode::TestResult) => {
                self.release_worker(pos);
                if reply.send(message.clone()).is_err() {
                    tracing::debug!("Test requester went away before the reply");
                }
            }
            (_, code) => {
                return Err(PreprocError::Worker(format!(
                    "unexpected message code {:?} from worker {}",
                    code, worker
                )));
            }
        }

        self.assign_tasks()?;
        self.flush();
        Ok(())
    }

    fn complete(&mut self, handle: NodeHandle, result: TaskResult) -> Result<()> {
        let Some(itemid) = self.queue.get(handle).map(|r| r.value.itemid) else {
            tracing::warn!("Result for a request no longer queued: {}", handle);
            return Ok(());
        };

        self.history.replace(itemid, result.history);
        self.set_done(handle);

        let max_error_len = self.config.max_error_len;
        let Some(request) = self.queue.get_mut(handle) else {
            return Ok(());
        };
        if set_variant_result(request, result.value, result.error, max_error_len) {
            let value = request.value.clone();
            self.enqueue_dependent(&value, Some(handle))?;
        }
        Ok(())
    }

    // ==================== Flush ====================

    /// Deliver the contiguous run of done requests at the queue head
    pub fn flush(&mut self) {
        while let Some(head) = self.queue.peek() {
            match self.queue.get(head) {
                Some(r) if r.state == RequestState::Done => {}
                _ => break,
            }

            if self.priority_tail.current() == Some(head) {
                self.priority_tail.clear();
            }
            if let Some((_, request)) = self.queue.pop() {
                self.deliver(request.value);
                self.processed_num += 1;
            }
        }
    }

    /// Commit buffered sink output
    pub fn flush_sink(&mut self) {
        self.sink.flush();
    }

    fn deliver(&mut self, value: ItemValue) {
        if value.flags.is_discovery() {
            self.sink.accept_discovery(value);
        } else {
            self.sink.accept(value);
        }
    }
}

/// Store a worker's outcome in the request.
///
/// Returns true when a value was produced, which is when dependents follow.
fn set_variant_result(
    request: &mut Request,
    value: Variant,
    error: Option<String>,
    max_error_len: usize,
) -> bool {
    if let Some(error) = error {
        request.value.state = ItemState::NotSupported;
        request.value.error = Some(error);
        request.value.value = Variant::None;
        return false;
    }

    if value.is_none() {
        request.value.value = Variant::None;
        return false;
    }

    match value.convert(request.value_type.target_kind()) {
        Some(converted) => {
            request.value.value = converted;
            true
        }
        None => {
            let error = format!(
                "Value \"{}\" of type \"{}\" is not suitable for value type \"{}\"",
                value.desc(),
                value.type_desc(),
                request.value_type
            );
            request.value.state = ItemState::NotSupported;
            request.value.error = Some(truncate_error(&error, max_error_len));
            request.value.value = Variant::None;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DependentItem, ItemConfig, StaticConfigSource};
    use crate::pipeline::sink::{MemorySink, SinkKind};
    use crate::protocol::pack_item_values;
    use crate::types::{ItemFlags, StepType};
    use crossbeam_channel::{unbounded, Receiver};

    const TOKEN: u64 = 0xfeed;

    struct Harness {
        manager: Manager,
        tasks: Receiver<TaskEnvelope>,
        sink: MemorySink,
        source: StaticConfigSource,
    }

    fn harness(workers: usize, items: Vec<ItemConfig>) -> Harness {
        let source = StaticConfigSource::from_items(items);
        let sink = MemorySink::new();
        let (tx, rx) = unbounded();
        let config = PreprocConfig {
            workers,
            ..Default::default()
        };
        let mut manager = Manager::new(
            config,
            Box::new(source.clone()),
            Box::new(sink.clone()),
            tx,
            TOKEN,
        );
        for _ in 0..workers {
            manager.register_worker(TOKEN).unwrap();
        }
        Harness {
            manager,
            tasks: rx,
            sink,
            source,
        }
    }

    fn multiply_item(itemid: u64) -> ItemConfig {
        ItemConfig::new(itemid, ValueType::Float)
            .with_steps(vec![Step::new(StepType::Multiplier, "2")])
    }

    fn ok_result(value: Variant) -> Message {
        TaskResult {
            value,
            ..Default::default()
        }
        .encode()
    }

    fn delivered(sink: &MemorySink) -> Vec<(u64, Variant)> {
        sink.records()
            .into_iter()
            .map(|r| (r.value.itemid, r.value.value))
            .collect()
    }

    #[test]
    fn test_unknown_item_flushed_inline() {
        let mut h = harness(1, vec![]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(5, ValueType::Str, "x")]))
            .unwrap();
        assert_eq!(delivered(&h.sink), vec![(5, Variant::from("x"))]);
        assert_eq!(h.manager.queue_size(), 0);
        assert!(h.tasks.try_recv().is_err());
    }

    #[test]
    fn test_value_dispatched_and_flushed() {
        let mut h = harness(1, vec![multiply_item(1)]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "21")]))
            .unwrap();
        let envelope = h.tasks.try_recv().unwrap();
        let task = TaskRequest::decode(&envelope.message).unwrap();
        assert_eq!(task.itemid, 1);
        assert_eq!(task.steps.len(), 1);
        assert_eq!(h.manager.preprocessing(), 1);

        h.manager
            .apply_result(envelope.worker, &ok_result(Variant::Dbl(42.0)))
            .unwrap();
        assert_eq!(delivered(&h.sink), vec![(1, Variant::Dbl(42.0))]);
        assert_eq!(h.manager.preprocessing(), 0);
        assert_eq!(h.manager.stats().processed, 1);
    }

    #[test]
    fn test_flush_keeps_arrival_order() {
        let mut h = harness(2, vec![multiply_item(1), multiply_item(2)]);
        h.manager
            .ingest(&pack_item_values(&[
                ItemValue::new(1, ValueType::Float, "1"),
                ItemValue::new(2, ValueType::Float, "2"),
            ]))
            .unwrap();
        let first = h.tasks.try_recv().unwrap();
        let second = h.tasks.try_recv().unwrap();

        h.manager
            .apply_result(second.worker, &ok_result(Variant::Dbl(4.0)))
            .unwrap();
        assert!(h.sink.is_empty());

        h.manager
            .apply_result(first.worker, &ok_result(Variant::Dbl(2.0)))
            .unwrap();
        assert_eq!(
            delivered(&h.sink),
            vec![(1, Variant::Dbl(2.0)), (2, Variant::Dbl(4.0))]
        );
    }

    #[test]
    fn test_order_sensitive_item_pending() {
        let item = ItemConfig::new(3, ValueType::Float)
            .with_steps(vec![Step::new(StepType::DeltaValue, "")]);
        let mut h = harness(2, vec![item]);
        h.manager
            .ingest(&pack_item_values(&[
                ItemValue::new(3, ValueType::Float, "10"),
                ItemValue::new(3, ValueType::Float, "15"),
            ]))
            .unwrap();

        // only the first request may run
        let first = h.tasks.try_recv().unwrap();
        assert!(h.tasks.try_recv().is_err());
        let states: Vec<_> = h.manager.requests().map(|(_, r)| r.state).collect();
        assert_eq!(states, vec![RequestState::Processing, RequestState::Pending]);

        h.manager.apply_result(first.worker, &ok_result(Variant::None)).unwrap();
        let second = h.tasks.try_recv().unwrap();
        assert_eq!(
            TaskRequest::decode(&second.message).unwrap().value,
            Variant::from("15")
        );
    }

    #[test]
    fn test_priority_items_ahead_in_arrival_order() {
        let internal = |id| multiply_item(id).with_kind(ItemKind::Internal);
        let mut h = harness(1, vec![multiply_item(1), internal(10), internal(11)]);
        // occupy the only worker
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "1")]))
            .unwrap();
        h.manager
            .ingest(&pack_item_values(&[
                ItemValue::new(1, ValueType::Float, "2"),
                ItemValue::new(10, ValueType::Float, "3"),
                ItemValue::new(11, ValueType::Float, "4"),
            ]))
            .unwrap();
        let order: Vec<u64> = h.manager.requests().map(|(_, r)| r.value.itemid).collect();
        assert_eq!(order, vec![10, 11, 1, 1]);
    }

    #[test]
    fn test_dependents_follow_master() {
        let master = multiply_item(1)
            .with_dependent(DependentItem::new(2))
            .with_dependent(DependentItem {
                itemid: 3,
                discovery: true,
            });
        let mut h = harness(1, vec![master]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "5")]))
            .unwrap();
        let task = h.tasks.try_recv().unwrap();
        h.manager.apply_result(task.worker, &ok_result(Variant::Dbl(10.0))).unwrap();

        let records = h.sink.records();
        let ids: Vec<u64> = records.iter().map(|r| r.value.itemid).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(records[2].kind, SinkKind::Discovery);
        assert_eq!(records[2].value.flags, ItemFlags::DISCOVERY_RULE);
        assert_eq!(records[1].value.value, Variant::Dbl(10.0));
    }

    #[test]
    fn test_step_error_sets_not_supported() {
        let mut h = harness(1, vec![multiply_item(1)]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "x")]))
            .unwrap();
        let task = h.tasks.try_recv().unwrap();
        let result = TaskResult {
            error: Some("cannot apply multiplier".into()),
            ..Default::default()
        };
        h.manager.apply_result(task.worker, &result.encode()).unwrap();
        let record = &h.sink.records()[0];
        assert_eq!(record.value.state, ItemState::NotSupported);
        assert_eq!(record.value.error.as_deref(), Some("cannot apply multiplier"));
    }

    #[test]
    fn test_unsuitable_result_type() {
        let item = ItemConfig::new(1, ValueType::Uint64)
            .with_steps(vec![Step::new(StepType::Trim, " ")]);
        let mut h = harness(1, vec![item]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Uint64, " abc ")]))
            .unwrap();
        let task = h.tasks.try_recv().unwrap();
        h.manager
            .apply_result(task.worker, &ok_result(Variant::from("abc")))
            .unwrap();
        let record = &h.sink.records()[0];
        assert_eq!(record.value.state, ItemState::NotSupported);
        assert_eq!(
            record.value.error.as_deref(),
            Some("Value \"abc\" of type \"string\" is not suitable for value type \"Numeric (unsigned)\"")
        );
    }

    #[test]
    fn test_not_supported_value_purges_history() {
        let item = ItemConfig::new(1, ValueType::Float)
            .with_steps(vec![Step::new(StepType::DeltaValue, "")]);
        let mut h = harness(1, vec![item]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "1")]))
            .unwrap();
        let task = h.tasks.try_recv().unwrap();
        let result = TaskResult {
            value: Variant::None,
            history: vec![crate::types::HistoryEntry::new(
                0,
                crate::types::HistoryValue::new(1.0, Default::default()),
            )],
            error: None,
        };
        h.manager.apply_result(task.worker, &result.encode()).unwrap();
        assert!(h.manager.history().contains(1));

        // worker is free, the not supported value completes without a task
        h.manager
            .ingest(&pack_item_values(&[ItemValue::not_supported(
                1,
                ValueType::Float,
                "timeout",
            )]))
            .unwrap();
        assert!(h.tasks.try_recv().is_err());
        assert!(!h.manager.history().contains(1));
        let last = h.sink.records().pop().unwrap();
        assert_eq!(last.value.state, ItemState::NotSupported);
    }

    #[test]
    fn test_config_change_purges_history() {
        let item = ItemConfig::new(1, ValueType::Float)
            .with_steps(vec![Step::new(StepType::DeltaValue, "")]);
        let mut h = harness(1, vec![item.clone(), multiply_item(2)]);
        h.manager.sync_config();
        h.manager.history.replace(
            1,
            vec![crate::types::HistoryEntry::new(0, Default::default())],
        );
        h.manager.history.replace(
            2,
            vec![crate::types::HistoryEntry::new(0, Default::default())],
        );

        h.source.upsert(item);
        h.manager.sync_config();
        assert!(!h.manager.history().contains(1));
        assert!(h.manager.history().contains(2));

        h.source.remove(2);
        h.manager.sync_config();
        assert!(!h.manager.history().contains(2));
    }

    #[test]
    fn test_foreign_registration_ignored() {
        let mut h = harness(1, vec![]);
        assert_eq!(h.manager.register_worker(1).unwrap(), None);
        assert!(h.manager.register_worker(TOKEN).unwrap_err().is_fatal());
    }

    #[test]
    fn test_result_from_idle_worker_is_fatal() {
        let mut h = harness(1, vec![]);
        let err = h
            .manager
            .apply_result(WorkerId(0), &ok_result(Variant::None))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_malformed_ingest_is_fatal() {
        let mut h = harness(1, vec![]);
        let msg = Message::new(MessageCode::Request, bytes::Bytes::from_static(&[1, 2, 3]));
        assert!(h.manager.ingest(&msg).unwrap_err().is_fatal());
    }

    #[test]
    fn test_worker_exit_drops_slot() {
        let mut h = harness(2, vec![multiply_item(1)]);
        h.manager
            .ingest(&pack_item_values(&[ItemValue::new(1, ValueType::Float, "1")]))
            .unwrap();
        h.manager.worker_exited();
        assert_eq!(h.manager.stats().workers, 1);
        h.manager.worker_exited();
        assert_eq!(h.manager.stats().workers, 1);

        let task = h.tasks.try_recv().unwrap();
        h.manager.apply_result(task.worker, &ok_result(Variant::Dbl(2.0))).unwrap();
        assert_eq!(h.manager.stats().workers, 0);
        assert_eq!(h.sink.len(), 1);
    }
}
