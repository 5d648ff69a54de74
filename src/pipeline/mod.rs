//! Manager side of the preprocessing pipeline.
//!
//! Values flow from collectors into a single manager thread, which orders
//! them, hands step chains to workers and delivers results to the sink:
//!
//! ```text
//! collectors ──► [Manager] ──tasks──► [Worker] x N
//!                    ▲                    │
//!                    └──────results───────┘
//!                    │
//!                    └──► Sink (values / discovery)
//! ```
//!
//! # Design
//!
//! - **Single writer**: the manager alone touches the queue, both caches
//!   and the worker registry; workers only see task snapshots.
//! - **Arena queue**: requests live in [`OrderedQueue`] and are addressed
//!   by generation-checked [`NodeHandle`]s, so remembered positions can be
//!   spliced after in O(1).
//! - **Arrival order out**: only the contiguous run of finished requests
//!   at the queue head is flushed.

pub mod bridge;
pub mod history;
pub mod id;
pub mod item_cache;
pub mod manager;
pub mod queue;
pub mod service;
pub mod sink;

pub use bridge::{
    manager_channel, ManagerMessage, PreprocessingClient, TaskEnvelope, ValueBatcher,
};
pub use history::HistoryCache;
pub use id::{NodeHandle, WorkerId};
pub use item_cache::{ConfigChange, ItemConfigCache};
pub use manager::{Manager, ManagerStats, Request, RequestState};
pub use queue::{OrderedQueue, QueueCursor};
pub use service::{ManagerService, Preprocessing};
pub use sink::{ChannelSink, MemorySink, Sink, SinkKind, SinkRecord};
