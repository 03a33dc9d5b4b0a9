//! Front-door surface: the operations an HTTP layer would expose. Input
//! validation happens here, before any workflow instance exists.

use crate::_typed_codec::{Codec, Json};
use crate::activities::ObjectStore;
use crate::engine::query::{QueryRequest, RAG_QUERY};
use crate::engine::transcribe::{TranscriptionRequest, TRANSCRIBE_AND_INDEX};
use crate::runtime::{Runtime, StartError, WaitError, WorkflowStatus};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Request rejected before any instance was created.
    Validation(String),
    /// An instance with the requested id already exists.
    DuplicateInstance(String),
    Other(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Validation(m) => write!(f, "validation: {m}"),
            ClientError::DuplicateInstance(i) => write!(f, "duplicate instance: {i}"),
            ClientError::Other(m) => write!(f, "{m}"),
        }
    }
}

fn map_start_error(instance: &str, e: StartError) -> ClientError {
    match e {
        StartError::AlreadyExists => ClientError::DuplicateInstance(instance.to_string()),
        StartError::Other(m) => ClientError::Other(m),
    }
}

pub struct Client {
    runtime: Arc<Runtime>,
    object_store: Arc<dyn ObjectStore>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self { runtime, object_store }
    }

    /// Upload an audio file and start a transcription workflow with a
    /// generated instance id. Returns the instance id.
    pub async fn submit_audio(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ClientError> {
        let podcast_id = podcast_id_from(file_name)?;
        let instance = format!("podcast-{}-{}", podcast_id, now_ms());
        self.submit_audio_as(&instance, file_name, bytes).await?;
        Ok(instance)
    }

    /// Upload an audio file and start a transcription workflow under a
    /// caller-chosen instance id.
    pub async fn submit_audio_as(&self, instance: &str, file_name: &str, bytes: Vec<u8>) -> Result<(), ClientError> {
        let podcast_id = podcast_id_from(file_name)?;
        if bytes.is_empty() {
            return Err(ClientError::Validation("audio file is empty".into()));
        }
        let file_url = self
            .object_store
            .upload(file_name, bytes)
            .await
            .map_err(|e| ClientError::Other(format!("upload failed: {e}")))?;
        let input = Json::encode(&TranscriptionRequest { file_url, podcast_id })
            .map_err(ClientError::Other)?;
        self.runtime
            .start_workflow(instance, TRANSCRIBE_AND_INDEX, input)
            .await
            .map_err(|e| map_start_error(instance, e))?;
        info!(instance, file_name, "accepted transcription request");
        Ok(())
    }

    /// Start a retrieval-augmented query workflow with a generated instance
    /// id. Returns the instance id.
    pub async fn submit_query(
        &self,
        query: &str,
        index_name: &str,
        filter: Option<String>,
    ) -> Result<String, ClientError> {
        let instance = format!("query-{}", now_ns());
        self.submit_query_as(&instance, query, index_name, filter).await?;
        Ok(instance)
    }

    /// Start a query workflow under a caller-chosen instance id.
    pub async fn submit_query_as(
        &self,
        instance: &str,
        query: &str,
        index_name: &str,
        filter: Option<String>,
    ) -> Result<(), ClientError> {
        if query.trim().is_empty() {
            return Err(ClientError::Validation("query must not be empty".into()));
        }
        if index_name.trim().is_empty() {
            return Err(ClientError::Validation("index name must not be empty".into()));
        }
        let input = Json::encode(&QueryRequest {
            query: query.to_string(),
            index_name: index_name.to_string(),
            filter,
        })
        .map_err(ClientError::Other)?;
        self.runtime
            .start_workflow(instance, RAG_QUERY, input)
            .await
            .map_err(|e| map_start_error(instance, e))?;
        info!(instance, index_name, "accepted query request");
        Ok(())
    }

    pub async fn status(&self, instance: &str) -> WorkflowStatus {
        self.runtime.get_workflow_status(instance).await
    }

    pub async fn wait(&self, instance: &str, timeout: std::time::Duration) -> Result<WorkflowStatus, WaitError> {
        self.runtime.wait_for_workflow(instance, timeout).await
    }
}

/// Derive a podcast id from the uploaded file name: the stem, lowercased,
/// with anything outside `[a-z0-9-]` collapsed to `-`.
fn podcast_id_from(file_name: &str) -> Result<String, ClientError> {
    let trimmed = file_name.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Validation("file name must not be empty".into()));
    }
    let stem = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let stem = stem.split('.').next().unwrap_or(stem);
    let mut id = String::with_capacity(stem.len());
    let mut last_dash = false;
    for ch in stem.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            id.push(ch);
            last_dash = false;
        } else if !last_dash && !id.is_empty() {
            id.push('-');
            last_dash = true;
        }
    }
    let id = id.trim_end_matches('-').to_string();
    if id.is_empty() {
        return Err(ClientError::Validation(format!(
            "file name '{file_name}' has no usable characters"
        )));
    }
    Ok(id)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_ns() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
