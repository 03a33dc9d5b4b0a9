use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{dedupe_key, HistoryStore, QueueKind, WorkItem};
use crate::Event;

const CAP: usize = 1024;

/// In-process store used by tests and single-process hosts. Durability is
/// limited to the process lifetime; semantics otherwise match `FsHistoryStore`.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    orchestrator_q: Mutex<Vec<WorkItem>>, // simple FIFO
    worker_q: Mutex<Vec<WorkItem>>,       // simple FIFO
    timer_q: Mutex<Vec<WorkItem>>,        // simple FIFO
    // Peek-lock state per-queue: token -> item. Items here are invisible until ack/abandon.
    invisible_orchestrator: Mutex<HashMap<String, WorkItem>>,
    invisible_worker: Mutex<HashMap<String, WorkItem>>,
    invisible_timer: Mutex<HashMap<String, WorkItem>>,
}

impl InMemoryHistoryStore {
    fn queue(&self, kind: QueueKind) -> &Mutex<Vec<WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
            QueueKind::Timer => &self.timer_q,
        }
    }

    fn invisible(&self, kind: QueueKind) -> &Mutex<HashMap<String, WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
            QueueKind::Timer => &self.invisible_timer,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, String> {
        let mut g = self.histories.lock().await;
        let history = g
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        if history.len() + new_events.len() > CAP {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                CAP,
                history.len(),
                new_events.len()
            ));
        }
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            history.iter().filter_map(dedupe_key).collect();
        let mut last_seq = history.last().map(|e| e.seq()).unwrap_or(0);
        for mut ev in new_events {
            if let Some(key) = dedupe_key(&ev) {
                if !seen.insert(key) {
                    continue;
                }
            }
            last_seq += 1;
            ev.set_seq(last_seq);
            history.push(ev);
        }
        Ok(last_seq)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.histories.lock().await;
        if g.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.histories.lock().await;
        if g.remove(instance).is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            self.queue(kind).lock().await.clear();
            self.invisible(kind).lock().await.clear();
        }
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if !q.contains(&item) {
            q.push(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = {
            let mut q = self.queue(kind).lock().await;
            if q.is_empty() {
                return None;
            }
            q.remove(0)
        };
        let token = format!(
            "{:?}:{}",
            kind,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .ok()?
                .as_nanos()
        );
        self.invisible(kind).lock().await.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.invisible(kind).lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        if let Some(item) = self.invisible(kind).lock().await.remove(token) {
            self.queue(kind).lock().await.insert(0, item);
        }
        Ok(())
    }
}
