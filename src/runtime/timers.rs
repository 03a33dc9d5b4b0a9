use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// In-process fallback timer service for providers without delayed
/// visibility. Maintains a min-ordered queue of `TimerSchedule` items and
/// enqueues `TimerFired` on the orchestrator queue when due.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<WorkItem>,
    // key -> (instance, id), keyed by "inst|id|fire_at_ms"
    items: HashMap<String, (String, u64)>,
    keys: HashSet<String>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    poller_idle_ms: u64,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn HistoryStore>,
        poller_idle_ms: u64,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedSender<WorkItem>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<WorkItem>();
        let mut svc = TimerService {
            store,
            rx,
            items: HashMap::new(),
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            // Drain any queued schedules
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            // Fire due timers
            let now = now_ms();
            let mut due: Vec<(String, u64, u64)> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts <= now {
                    let _ = self.min_heap.pop();
                    if let Some((inst, id)) = self.items.remove(&key) {
                        self.keys.remove(&key);
                        due.push((inst, id, ts));
                    }
                } else {
                    break;
                }
            }

            for (instance, id, fire_at_ms) in due.drain(..) {
                let _ = self
                    .store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                        },
                    )
                    .await;
            }

            // Wait for next due time or the next schedule
            if let Some(Reverse((next_ts, _))) = self.min_heap.peek().cloned() {
                let now = now_ms();
                let dur_ms = next_ts.saturating_sub(now).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(item) => self.insert_item(item),
                            _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                        }
                    }
                }
            } else {
                // No timers; block on next schedule
                match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                }
            }
        }
    }

    fn insert_item(&mut self, item: WorkItem) {
        if let WorkItem::TimerSchedule {
            instance,
            id,
            fire_at_ms,
        } = item
        {
            let key = format!("{}|{}|{}", instance, id, fire_at_ms);
            if self.keys.insert(key.clone()) {
                self.min_heap.push(Reverse((fire_at_ms, key.clone())));
                self.items.insert(key, (instance, id));
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
