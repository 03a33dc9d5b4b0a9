//! Capability traits for the external services the pipeline calls. Hosts
//! inject implementations at activity registration; tests script them.

use super::ActivityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Blob/object storage holding the uploaded audio files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a named object and return a URL the transcriber can fetch.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, ActivityError>;

    async fn delete(&self, name: &str) -> Result<(), ActivityError>;
}

/// Batch speech-to-text service with asynchronous job semantics.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Submit a transcription job; returns the provider's job id.
    async fn start(&self, audio_url: &str, locale: &str) -> Result<String, ActivityError>;

    /// Poll a job. `Ok(None)` means still running; a provider-reported
    /// terminal failure must surface as `ActivityError::Permanent`.
    async fn poll(&self, job_id: &str) -> Result<Option<String>, ActivityError>;
}

/// Text embedding service.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ActivityError>;
}

/// Chunk plus vector stored in the search index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub content: String,
    pub vector: Vec<f32>,
}

/// Search hit returned by a hybrid query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub content: String,
    pub score: f32,
}

/// Vector/keyword search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index if it does not exist yet.
    async fn ensure_exists(&self, index: &str) -> Result<(), ActivityError>;

    /// Upsert documents; returns the number stored.
    async fn upsert(&self, index: &str, documents: Vec<IndexDocument>) -> Result<usize, ActivityError>;

    /// Hybrid (keyword + vector) search returning the top `top_k` hits.
    async fn search(
        &self,
        index: &str,
        query: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<SearchHit>, ActivityError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub action_items: Vec<String>,
}

/// Generative model used for summaries and grounded answers.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<Summary, ActivityError>;

    async fn answer(&self, prompt: &str) -> Result<String, ActivityError>;
}
