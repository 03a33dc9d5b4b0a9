//! Pure decision engine: replaying the persisted event log against workflow
//! code yields the next `Action`. No clock, network, or store access happens
//! here; everything the engine knows comes from the history slice.

use crate::{Action, Event};
use std::collections::HashMap;
use std::sync::Arc;

mod steps;
pub use steps::Steps;

pub mod query;
pub mod transcribe;

/// A deterministic workflow definition.
///
/// `run` is invoked from scratch on every decision cycle with a fresh replay
/// cursor. `Err(action)` suspends the workflow on the action to dispatch
/// next (or fails it, for terminal `Fail` actions raised mid-replay);
/// `Ok(action)` is the final decision.
pub trait Workflow: Send + Sync {
    fn run(&self, steps: &mut Steps<'_>) -> Result<Action, Action>;
}

/// Produce the next action for an instance from its history prefix.
///
/// Pure and idempotent: calling this any number of times over the same
/// history yields the same action, including correlation ids.
pub fn decide(workflow: &dyn Workflow, history: &[Event]) -> Action {
    let mut steps = Steps::new(history);
    match workflow.run(&mut steps) {
        Ok(action) | Err(action) => action,
    }
}

/// Immutable registry mapping workflow names to definitions.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<dyn Workflow>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.inner.get(name).cloned()
    }

    pub fn list_workflow_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, workflow: impl Workflow + 'static) -> Self {
        self.map.insert(name.into(), Arc::new(workflow));
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }
}

/// Registry with the two pipeline workflows configured from `PipelineConfig`.
pub fn pipeline_workflows(config: &crate::PipelineConfig) -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(
            transcribe::TRANSCRIBE_AND_INDEX,
            transcribe::TranscribeAndIndex {
                poll_interval_ms: config.poll_interval_ms,
                max_wait_ms: config.max_wait_ms,
            },
        )
        .register(
            query::RAG_QUERY,
            query::RagQuery {
                retry: config.query_retry.clone(),
            },
        )
        .build()
}
