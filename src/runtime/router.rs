use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Completion messages delivered to an instance's decision loop by the
/// dispatchers. The ack token, when present, is released only after the
/// matching history append is durable.
pub enum CompletionMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
}

impl CompletionMsg {
    pub fn instance(&self) -> &str {
        match self {
            CompletionMsg::ActivityCompleted { instance, .. }
            | CompletionMsg::ActivityFailed { instance, .. }
            | CompletionMsg::TimerFired { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CompletionMsg::ActivityCompleted { .. } => "ActivityCompleted",
            CompletionMsg::ActivityFailed { .. } => "ActivityFailed",
            CompletionMsg::TimerFired { .. } => "TimerFired",
        }
    }
}

/// Routes completion messages to per-instance inboxes.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<CompletionMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<CompletionMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn is_registered(&self, instance: &str) -> bool {
        self.inboxes.lock().await.contains_key(instance)
    }

    /// Send to the instance inbox; on failure the stale sender is removed so
    /// dispatchers can rehydrate on redelivery.
    pub async fn try_send(&self, msg: CompletionMsg) -> Result<(), ()> {
        let key = msg.instance().to_string();
        let kind = msg.kind();
        let mut map = self.inboxes.lock().await;
        match map.get(&key) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    map.remove(&key);
                    warn!(instance=%key, kind=%kind, "router: receiver dropped, removing inbox");
                    return Err(());
                }
                Ok(())
            }
            None => {
                warn!(instance=%key, kind=%kind, "router: unknown instance, cannot send");
                Err(())
            }
        }
    }
}

impl Default for InstanceRouter {
    fn default() -> Self {
        Self::new()
    }
}
