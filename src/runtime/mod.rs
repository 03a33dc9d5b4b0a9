//! Workflow dispatcher: drives instances through decide/persist/dispatch
//! cycles, executes activities with bounded retry, and fires durable timers.
//! All state lives in the `HistoryStore`; the runtime can be restarted at any
//! point and resumes from the persisted log.

use crate::engine::{decide, WorkflowRegistry};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Action, Event};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub mod registry;
pub mod router;
pub mod status;
pub mod timers;

pub use registry::{ActivityHandler, ActivityRegistry, ActivityRegistryBuilder};
pub use router::{CompletionMsg, InstanceRouter};
pub use status::{WaitError, WorkflowStatus};

/// Error returned when a workflow instance cannot be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// An instance with this id already exists; its history is untouched.
    AlreadyExists,
    Other(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyExists => write!(f, "instance already exists"),
            StartError::Other(e) => write!(f, "{e}"),
        }
    }
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    workflows: WorkflowRegistry,
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const INSTANCE_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(activities: ActivityRegistry, workflows: WorkflowRegistry) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activities, workflows).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::new()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            workflows,
        });

        let handle = runtime.clone().start_orchestrator_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher(activities);
        runtime.joins.lock().await.push(work_handle);

        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        // Pick up instances that were in flight when the previous host stopped
        let boot = runtime.clone();
        tokio::spawn(async move {
            boot.resume_inflight_instances().await;
        });

        runtime
    }

    /// Reactivate every non-terminal instance found in the store. Activation
    /// rehydrates pending work, so timers and activities lost with a previous
    /// process are re-enqueued here.
    pub async fn resume_inflight_instances(self: &Arc<Self>) {
        for instance in self.history_store.list_instances().await {
            let history = self.history_store.read(&instance).await;
            let terminal = history.last().map(|e| e.is_terminal()).unwrap_or(false);
            if !history.is_empty() && !terminal {
                debug!(instance, "resuming in-flight instance");
                self.ensure_instance_active(&instance).await;
            }
        }
    }

    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    /// Create a new workflow instance and begin driving it.
    ///
    /// Creation is rejected for duplicate instance ids without touching the
    /// existing history. `started_at_ms` is captured here, once; replay
    /// derives all later logical time from it.
    pub async fn start_workflow(
        self: &Arc<Self>,
        instance: &str,
        workflow: &str,
        input: impl Into<String>,
    ) -> Result<(), StartError> {
        if self.workflows.get(workflow).is_none() {
            return Err(StartError::Other(format!("unregistered workflow: {workflow}")));
        }
        self.history_store.create_instance(instance).await.map_err(|e| {
            if e.contains("already exists") {
                StartError::AlreadyExists
            } else {
                StartError::Other(e)
            }
        })?;
        let started = Event::InstanceStarted {
            seq: 0,
            workflow: workflow.to_string(),
            input: input.into(),
            started_at_ms: now_ms(),
        };
        self.history_store
            .append(instance, vec![started])
            .await
            .map_err(|e| StartError::Other(format!("failed to append InstanceStarted: {e}")))?;
        self.ensure_instance_active(instance).await;
        Ok(())
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let this = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move {
            this.run_instance_to_completion(&inst).await;
        });
        self.instance_joins.lock().await.push(handle);
        true
    }

    fn start_orchestrator_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Some((item, token)) => match item {
                        WorkItem::ActivityCompleted { instance, id, result } => {
                            debug!(instance, id, "dispatch: activity completed");
                            self.deliver_or_rehydrate(&instance, token, |t| CompletionMsg::ActivityCompleted {
                                instance: instance.clone(),
                                id,
                                result: result.clone(),
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::ActivityFailed { instance, id, error } => {
                            debug!(instance, id, error, "dispatch: activity failed");
                            self.deliver_or_rehydrate(&instance, token, |t| CompletionMsg::ActivityFailed {
                                instance: instance.clone(),
                                id,
                                error: error.clone(),
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        WorkItem::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                        } => {
                            debug!(instance, id, fire_at_ms, "dispatch: timer fired");
                            self.deliver_or_rehydrate(&instance, token, |t| CompletionMsg::TimerFired {
                                instance: instance.clone(),
                                id,
                                fire_at_ms,
                                ack_token: Some(t),
                            })
                            .await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in orchestrator dispatcher; state corruption");
                            panic!("unexpected WorkItem in orchestrator dispatcher");
                        }
                    },
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    }
                }
            }
        })
    }

    /// Forward a completion into the instance inbox; if the instance is
    /// dehydrated, reactivate it and abandon the item for redelivery. A
    /// completion for an already-terminal instance is a stale redelivery
    /// (duplicate execution after rehydration, or a crash between append and
    /// ack) and is dropped by acking it, so it never blocks the queue.
    async fn deliver_or_rehydrate<F>(self: &Arc<Self>, instance: &str, token: String, build_msg: F)
    where
        F: FnOnce(String) -> CompletionMsg,
    {
        if !self.router.is_registered(instance).await {
            let history = self.history_store.read(instance).await;
            if history.last().map(|e| e.is_terminal()).unwrap_or(false) {
                debug!(instance, "dropping stale completion for terminal instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            if history.is_empty() {
                warn!(instance, "dropping completion for unknown instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            self.ensure_instance_active(instance).await;
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }
        let msg = build_msg(token.clone());
        if self.router.try_send(msg).await.is_err() {
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: ActivityRegistry) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.history_store.dequeue_peek_lock(QueueKind::Worker).await {
                    Some((item, token)) => match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                            retry,
                        } => {
                            let outcome = match activities.get(&name) {
                                Some(handler) => {
                                    // Retry loop: fixed backoff, transient errors only
                                    let mut attempt: u32 = 1;
                                    loop {
                                        match handler.invoke(input.clone()).await {
                                            Ok(result) => break Ok(result),
                                            Err(e) => {
                                                if e.is_transient() && attempt < retry.max_attempts {
                                                    warn!(
                                                        instance, id, name, attempt,
                                                        error = %e,
                                                        "activity attempt failed; retrying"
                                                    );
                                                    tokio::time::sleep(std::time::Duration::from_millis(
                                                        retry.first_retry_interval_ms,
                                                    ))
                                                    .await;
                                                    attempt += 1;
                                                    continue;
                                                }
                                                break Err(e.message().to_string());
                                            }
                                        }
                                    }
                                }
                                None => Err(format!("unregistered activity: {name}")),
                            };
                            let completion = match outcome {
                                Ok(result) => WorkItem::ActivityCompleted {
                                    instance: instance.clone(),
                                    id,
                                    result,
                                },
                                Err(error) => {
                                    warn!(instance, id, name, error, "activity failed");
                                    WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        error,
                                    }
                                }
                            };
                            let _ = self.history_store.enqueue_work(QueueKind::Orchestrator, completion).await;
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in worker dispatcher; state corruption");
                            panic!("unexpected WorkItem in worker dispatcher");
                        }
                    },
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    }
                }
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        if self.history_store.supports_delayed_visibility() {
            return tokio::spawn(async move {
                loop {
                    match self.history_store.dequeue_peek_lock(QueueKind::Timer).await {
                        Some((item, token)) => match item {
                            WorkItem::TimerSchedule {
                                instance,
                                id,
                                fire_at_ms,
                            } => {
                                // Provider holds the fired item invisible until due
                                let _ = self
                                    .history_store
                                    .enqueue_work(
                                        QueueKind::Orchestrator,
                                        WorkItem::TimerFired {
                                            instance,
                                            id,
                                            fire_at_ms,
                                        },
                                    )
                                    .await;
                                let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                            }
                            other => {
                                error!(?other, "unexpected WorkItem in timer dispatcher; state corruption");
                                panic!("unexpected WorkItem in timer dispatcher");
                            }
                        },
                        None => {
                            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                        }
                    }
                }
            });
        }

        // Fallback in-process timer service
        tokio::spawn(async move {
            let (svc_jh, svc_tx) =
                timers::TimerService::start(self.history_store.clone(), Self::POLLER_IDLE_SLEEP_MS);

            let intake_rt = self.clone();
            tokio::spawn(async move {
                loop {
                    match intake_rt.history_store.dequeue_peek_lock(QueueKind::Timer).await {
                        Some((item, token)) => match item {
                            WorkItem::TimerSchedule { .. } => {
                                let _ = svc_tx.send(item);
                                let _ = intake_rt.history_store.ack(QueueKind::Timer, &token).await;
                            }
                            other => {
                                error!(?other, "unexpected WorkItem in timer dispatcher; state corruption");
                                panic!("unexpected WorkItem in timer dispatcher");
                            }
                        },
                        None => {
                            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                        }
                    }
                }
            });
            // Keep service join handle alive within dispatcher lifetime
            let _ = svc_jh.await;
        })
    }

    /// Drive one instance until it reaches a terminal event or goes idle.
    ///
    /// One decision cycle: decide over the persisted history, persist and
    /// dispatch the resulting action, then block on the instance inbox for
    /// completions. Completions are persisted (idempotently) before their
    /// queue tokens are acked, so a crash between the two only causes a
    /// redelivery that the history dedupe absorbs.
    async fn run_instance_to_completion(self: &Arc<Self>, instance: &str) {
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return;
            }
        }
        // Ensure removal of the active flag even if this task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                // Drop can't be async; spawn the removal
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut history = self.history_store.read(instance).await;
        let workflow_name = match history.iter().find_map(|e| match e {
            Event::InstanceStarted { workflow, .. } => Some(workflow.clone()),
            _ => None,
        }) {
            Some(name) => name,
            None => {
                error!(instance, "activation requested but history has no InstanceStarted");
                return;
            }
        };
        if history.last().map(|e| e.is_terminal()).unwrap_or(false) {
            return;
        }
        let workflow = match self.workflows.get(&workflow_name) {
            Some(w) => w,
            None => {
                let err = format!("unregistered workflow: {workflow_name}");
                if let Err(e) = self
                    .history_store
                    .append(instance, vec![Event::InstanceFailed { seq: 0, error: err.clone() }])
                    .await
                {
                    error!(instance, error=%e, "failed to append InstanceFailed for unknown workflow");
                }
                return;
            }
        };

        let mut inbox = self.router.register(instance).await;

        // Re-enqueue in-flight work after a restart; queue and history dedupe
        // keep execution at-most-logically-once.
        self.rehydrate_pending(instance, &history).await;

        loop {
            let action = decide(workflow.as_ref(), &history);
            debug!(instance, ?action, "decision");
            match action {
                Action::ScheduleActivity {
                    id,
                    name,
                    input,
                    retry,
                } => {
                    let already_scheduled = history
                        .iter()
                        .any(|e| matches!(e, Event::ActivityScheduled { id: eid, .. } if *eid == id));
                    if !already_scheduled {
                        if let Err(e) = self
                            .history_store
                            .append(
                                instance,
                                vec![Event::ActivityScheduled {
                                    seq: 0,
                                    id,
                                    name: name.clone(),
                                    input: input.clone(),
                                    retry: retry.clone(),
                                }],
                            )
                            .await
                        {
                            error!(instance, id, error=%e, "failed to append ActivityScheduled");
                            break;
                        }
                        history = self.history_store.read(instance).await;
                    }
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.to_string(),
                                id,
                                name,
                                input,
                                retry,
                            },
                        )
                        .await;
                }
                Action::ScheduleTimer { id, fire_at_ms } => {
                    let already_created = history
                        .iter()
                        .any(|e| matches!(e, Event::TimerCreated { id: eid, .. } if *eid == id));
                    if !already_created {
                        if let Err(e) = self
                            .history_store
                            .append(instance, vec![Event::TimerCreated { seq: 0, id, fire_at_ms }])
                            .await
                        {
                            error!(instance, id, error=%e, "failed to append TimerCreated");
                            break;
                        }
                        history = self.history_store.read(instance).await;
                    }
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Timer,
                            WorkItem::TimerSchedule {
                                instance: instance.to_string(),
                                id,
                                fire_at_ms,
                            },
                        )
                        .await;
                }
                Action::Complete { output } => {
                    if let Err(e) = self
                        .history_store
                        .append(instance, vec![Event::InstanceCompleted { seq: 0, output }])
                        .await
                    {
                        error!(instance, error=%e, "failed to append InstanceCompleted");
                    }
                    break;
                }
                Action::Fail { error } => {
                    warn!(instance, error, "workflow failed");
                    if let Err(e) = self
                        .history_store
                        .append(instance, vec![Event::InstanceFailed { seq: 0, error }])
                        .await
                    {
                        error!(instance, error=%e, "failed to append InstanceFailed");
                    }
                    break;
                }
            }

            // Block for at least one completion, or dehydrate when idle
            let first = match tokio::time::timeout(
                std::time::Duration::from_millis(Self::INSTANCE_IDLE_DEHYDRATE_MS),
                inbox.recv(),
            )
            .await
            {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_idle) => {
                    debug!(instance, "idle; dehydrating");
                    break;
                }
            };
            let mut batch = vec![first];
            for _ in 0..Self::COMPLETION_BATCH_LIMIT {
                match inbox.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let mut events = Vec::with_capacity(batch.len());
            let mut ack_tokens = Vec::new();
            for msg in batch {
                let (event, token) = match msg {
                    CompletionMsg::ActivityCompleted {
                        id, result, ack_token, ..
                    } => (Event::ActivityCompleted { seq: 0, id, result }, ack_token),
                    CompletionMsg::ActivityFailed { id, error, ack_token, .. } => {
                        (Event::ActivityFailed { seq: 0, id, error }, ack_token)
                    }
                    CompletionMsg::TimerFired {
                        id,
                        fire_at_ms,
                        ack_token,
                        ..
                    } => (Event::TimerFired { seq: 0, id, fire_at_ms }, ack_token),
                };
                events.push(event);
                if let Some(t) = token {
                    ack_tokens.push(t);
                }
            }
            if let Err(e) = self.history_store.append(instance, events).await {
                error!(instance, error=%e, "failed to append completions");
                break;
            }
            // Ack only after the append is durable
            for t in ack_tokens {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }
            history = self.history_store.read(instance).await;
        }

        self.router.unregister(instance).await;
    }

    /// Re-enqueue work for scheduled events that have no completion yet.
    async fn rehydrate_pending(&self, instance: &str, history: &[Event]) {
        let completed: HashSet<u64> = history.iter().filter_map(|e| match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } | Event::TimerFired { id, .. } => {
                Some(*id)
            }
            _ => None,
        })
        .collect();
        for ev in history {
            match ev {
                Event::ActivityScheduled {
                    id, name, input, retry, ..
                } if !completed.contains(id) => {
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.to_string(),
                                id: *id,
                                name: name.clone(),
                                input: input.clone(),
                                retry: retry.clone(),
                            },
                        )
                        .await;
                }
                Event::TimerCreated { id, fire_at_ms, .. } if !completed.contains(id) => {
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Timer,
                            WorkItem::TimerSchedule {
                                instance: instance.to_string(),
                                id: *id,
                                fire_at_ms: *fire_at_ms,
                            },
                        )
                        .await;
                }
                _ => {}
            }
        }
    }

    /// Abort background tasks. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        let mut instance_joins = self.instance_joins.lock().await;
        for j in instance_joins.drain(..) {
            j.abort();
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
