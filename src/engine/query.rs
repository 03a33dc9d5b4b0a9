//! Retrieval-augmented query workflow: a single activity invocation wrapped
//! in a fixed-backoff retry policy that masks index propagation lag.

use crate::engine::{Steps, Workflow};
use crate::{Action, RetryPolicy};
use serde::{Deserialize, Serialize};

pub const RAG_QUERY: &str = "rag_query";

/// Activity behind the workflow; the workflow and activity registries are
/// separate namespaces, so the names intentionally coincide.
pub const RAG_QUERY_ACTIVITY: &str = "rag_query";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub index_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub answer: String,
    pub sources: Vec<QuerySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySource {
    pub content: String,
    pub score: f32,
}

pub struct RagQuery {
    pub retry: RetryPolicy,
}

impl Default for RagQuery {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::fixed(3, 3000),
        }
    }
}

impl Workflow for RagQuery {
    fn run(&self, steps: &mut Steps<'_>) -> Result<Action, Action> {
        // Validate the shape early; the raw payload passes through unchanged.
        let _request: QueryRequest = steps.input_typed()?;
        let input = steps.input().to_string();
        let output = steps.activity_with_retry(RAG_QUERY_ACTIVITY, input, self.retry.clone())?;
        Ok(Action::Complete { output })
    }
}
