//! Durable workflow core for a podcast transcription and retrieval pipeline.
//!
//! The crate records append-only `Event`s per workflow instance and replays
//! them to make workflow logic deterministic. It provides:
//!
//! - Public data model: `Event`, `Action`, `RetryPolicy`
//! - A pure decision engine: `engine::decide` over a replay cursor (`Steps`)
//! - A runtime that persists history via a `HistoryStore`, executes
//!   activities with bounded retry, and fires durable timers
//! - A `Client` modeling the operations an HTTP front door would invoke

pub mod activities;
pub mod client;
pub mod config;
pub mod engine;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError};
pub use config::PipelineConfig;
pub use engine::{decide, Steps, Workflow, WorkflowRegistry, WorkflowRegistryBuilder};
pub use runtime::{Runtime, StartError, WaitError, WorkflowStatus};

use serde::{Deserialize, Serialize};

/// Terminal error recorded when a transcription job never produces a
/// transcript within the polling window. Status derivation matches on this
/// exact string to classify the instance as timed out.
pub const TRANSCRIPTION_TIMEOUT_ERROR: &str = "transcription timed out";

/// Terminal error recorded when the transcription provider does not return a
/// usable job id.
pub const TRANSCRIPTION_START_ERROR: &str = "transcription could not be started";

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return raw content to keep payloads readable
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            // Try parse as JSON first
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Retry behavior for a single activity invocation. Backoff is fixed, not
/// exponential: every retry waits `first_retry_interval_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocation budget including the first attempt. Always >= 1.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub first_retry_interval_ms: u64,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            first_retry_interval_ms: 0,
        }
    }

    /// Fixed-interval retries up to `max_attempts` total invocations.
    pub fn fixed(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_retry_interval_ms: interval_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Append-only workflow history entries persisted by a provider and consumed
/// during replay. `seq` is the per-instance sequence number assigned by the
/// provider at append time; `id` is the stable correlation id pairing
/// scheduling events with their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was created and started for a named workflow with input.
    InstanceStarted {
        seq: u64,
        workflow: String,
        input: String,
        started_at_ms: u64,
    },
    /// Activity was scheduled with a unique correlation id, input, and retry policy.
    ActivityScheduled {
        seq: u64,
        id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    /// Activity completed successfully with a result payload.
    ActivityCompleted { seq: u64, id: u64, result: String },
    /// Activity failed after its retry budget was exhausted.
    ActivityFailed { seq: u64, id: u64, error: String },
    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { seq: u64, id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { seq: u64, id: u64, fire_at_ms: u64 },
    /// Workflow completed with a final output (terminal).
    InstanceCompleted { seq: u64, output: String },
    /// Workflow failed with a final error (terminal).
    InstanceFailed { seq: u64, error: String },
}

impl Event {
    pub fn seq(&self) -> u64 {
        match self {
            Event::InstanceStarted { seq, .. }
            | Event::ActivityScheduled { seq, .. }
            | Event::ActivityCompleted { seq, .. }
            | Event::ActivityFailed { seq, .. }
            | Event::TimerCreated { seq, .. }
            | Event::TimerFired { seq, .. }
            | Event::InstanceCompleted { seq, .. }
            | Event::InstanceFailed { seq, .. } => *seq,
        }
    }

    pub(crate) fn set_seq(&mut self, value: u64) {
        match self {
            Event::InstanceStarted { seq, .. }
            | Event::ActivityScheduled { seq, .. }
            | Event::ActivityCompleted { seq, .. }
            | Event::ActivityFailed { seq, .. }
            | Event::TimerCreated { seq, .. }
            | Event::TimerFired { seq, .. }
            | Event::InstanceCompleted { seq, .. }
            | Event::InstanceFailed { seq, .. } => *seq = value,
        }
    }

    /// Correlation id for scheduling/completion pairs; terminal and start
    /// events carry none.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. } => Some(*id),
            Event::InstanceStarted { .. } | Event::InstanceCompleted { .. } | Event::InstanceFailed { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::InstanceStarted { .. } => "InstanceStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::InstanceCompleted { .. } => "InstanceCompleted",
            Event::InstanceFailed { .. } => "InstanceFailed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::InstanceCompleted { .. } | Event::InstanceFailed { .. })
    }
}

/// Declarative decision produced by one engine pass. The runtime is
/// responsible for persisting the corresponding `Event` and dispatching work;
/// the engine itself performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation with a retry policy.
    ScheduleActivity {
        id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    /// Create a durable timer that fires at the absolute wall-clock time.
    ScheduleTimer { id: u64, fire_at_ms: u64 },
    /// Complete the workflow with a final output (terminal).
    Complete { output: String },
    /// Fail the workflow with a final error (terminal).
    Fail { error: String },
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Complete { .. } | Action::Fail { .. })
    }
}
