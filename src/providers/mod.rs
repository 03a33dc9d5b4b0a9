//! Persistence contract for workflow histories and work queues.

use crate::{Event, RetryPolicy};
use serde::{Deserialize, Serialize};

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// Queue partitions served by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Durable queue messages exchanged between the dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// Execute an activity on the worker dispatcher.
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    /// Deliver an activity result to the instance's decision loop.
    ActivityCompleted { instance: String, id: u64, result: String },
    /// Deliver an activity failure (post-retry) to the decision loop.
    ActivityFailed { instance: String, id: u64, error: String },
    /// Register a durable timer with the timer dispatcher.
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    /// Deliver a fired timer to the decision loop.
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. } => instance,
        }
    }
}

/// Append-only history storage plus peek-lock work queues.
///
/// `append` assigns monotonic per-instance sequence numbers and must be
/// idempotent for completion-like events: a duplicate delivery of
/// `ActivityCompleted`/`ActivityFailed`/`TimerFired` (by correlation id) or a
/// duplicate terminal event appends nothing. Schedule-like events are
/// appended as given; the runtime only appends them when absent from history.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full ordered history for an instance (empty if unknown).
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Append events, assigning sequence numbers; returns the last sequence
    /// number in the instance's history after the append.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, String>;

    /// Create an empty history for the instance; errors if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    async fn list_instances(&self) -> Vec<String>;

    /// Drop all stored data. Test hook.
    async fn reset(&self);

    /// Human-readable dump of all histories, for diagnostics.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await {
                out.push_str(&format!("  {ev:?}\n"));
            }
        }
        out
    }

    /// Enqueue a work item; duplicate items already queued are ignored.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Dequeue the next item under a peek-lock token. The item stays
    /// invisible until `ack` (remove) or `abandon` (requeue at front).
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Whether the provider can hold a `TimerFired` invisible until its due
    /// time, making the in-process timer service unnecessary.
    fn supports_delayed_visibility(&self) -> bool {
        false
    }
}

/// Completion-like dedupe key: `(correlation id, kind tag)`. Terminal events
/// use a synthetic id of 0 since at most one may exist.
pub(crate) fn dedupe_key(event: &Event) -> Option<(u64, &'static str)> {
    match event {
        Event::ActivityCompleted { id, .. } => Some((*id, "ac")),
        Event::ActivityFailed { id, .. } => Some((*id, "af")),
        Event::TimerFired { id, .. } => Some((*id, "tf")),
        Event::InstanceCompleted { .. } => Some((0, "ic")),
        Event::InstanceFailed { .. } => Some((0, "if")),
        _ => None,
    }
}
