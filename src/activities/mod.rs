//! Activity implementations for the transcription and query pipeline, plus
//! the transient/permanent error taxonomy the worker retry loop honors.

use crate::_typed_codec::{Codec, Json};
use crate::config::PipelineConfig;
use crate::engine::query::{QueryOutput, QueryRequest, QuerySource, RAG_QUERY_ACTIVITY};
use crate::engine::transcribe::{
    ChunkAndIndexRequest, ChunkAndIndexResult, CHECK_TRANSCRIPTION, CHUNK_AND_INDEX, START_TRANSCRIPTION, SUMMARIZE,
};
use crate::runtime::registry::{ActivityRegistry, ActivityRegistryBuilder};
use std::sync::Arc;

pub mod chunking;
pub mod collaborators;

pub use chunking::TranscriptChunker;
pub use collaborators::{
    EmbeddingService, IndexDocument, LanguageModel, ObjectStore, SearchHit, SearchIndex, Summary, Transcriber,
};

/// Failure classification for one activity attempt. Transient failures are
/// retried per the scheduled `RetryPolicy`; permanent failures are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    Transient(String),
    Permanent(String),
}

impl ActivityError {
    pub fn message(&self) -> &str {
        match self {
            ActivityError::Transient(m) | ActivityError::Permanent(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Transient(m) => write!(f, "transient: {m}"),
            ActivityError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

/// A malformed payload can never succeed on retry.
fn decode_err(context: &str, e: String) -> ActivityError {
    ActivityError::Permanent(format!("{context}: {e}"))
}

/// External services the activities talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub object_store: Arc<dyn ObjectStore>,
    pub transcriber: Arc<dyn Transcriber>,
    pub embeddings: Arc<dyn EmbeddingService>,
    pub search: Arc<dyn SearchIndex>,
    pub language_model: Arc<dyn LanguageModel>,
}

/// Build the activity registry for the pipeline against the given
/// collaborators.
pub fn pipeline_activities(config: &PipelineConfig, services: Collaborators) -> ActivityRegistry {
    let locale = config.locale.clone();
    let chunker = Arc::new(TranscriptChunker::new(config.chunk_size, config.chunk_overlap));
    let top_k = config.top_k;

    let mut builder = ActivityRegistryBuilder::new();

    let transcriber = services.transcriber.clone();
    builder = builder.register(START_TRANSCRIPTION, move |file_url: String| {
        let transcriber = transcriber.clone();
        let locale = locale.clone();
        async move { transcriber.start(&file_url, &locale).await }
    });

    let transcriber = services.transcriber.clone();
    builder = builder.register(CHECK_TRANSCRIPTION, move |job_id: String| {
        let transcriber = transcriber.clone();
        async move {
            let polled = transcriber.poll(&job_id).await?;
            // `None` encodes as `null`, the workflow's "still running" marker
            Json::encode(&polled).map_err(|e| ActivityError::Permanent(format!("encode poll result: {e}")))
        }
    });

    let embeddings = services.embeddings.clone();
    let search = services.search.clone();
    builder = builder.register(CHUNK_AND_INDEX, move |input: String| {
        let embeddings = embeddings.clone();
        let search = search.clone();
        let chunker = chunker.clone();
        async move {
            let request: ChunkAndIndexRequest =
                Json::decode(&input).map_err(|e| decode_err("decode chunk_and_index input", e))?;
            let chunks = chunker.chunk(&request.transcript);
            search.ensure_exists(&request.index_name).await?;
            let vectors = embeddings.embed(&chunks).await?;
            if vectors.len() != chunks.len() {
                return Err(ActivityError::Permanent(format!(
                    "embedding count mismatch: {} chunks, {} vectors",
                    chunks.len(),
                    vectors.len()
                )));
            }
            let documents = chunks
                .into_iter()
                .zip(vectors)
                .enumerate()
                .map(|(i, (content, vector))| IndexDocument {
                    id: format!("{}-{}", request.index_name, i),
                    content,
                    vector,
                })
                .collect();
            let chunks_indexed = search.upsert(&request.index_name, documents).await?;
            Json::encode(&ChunkAndIndexResult { chunks_indexed })
                .map_err(|e| ActivityError::Permanent(format!("encode chunk_and_index result: {e}")))
        }
    });

    let language_model = services.language_model.clone();
    builder = builder.register(SUMMARIZE, move |transcript: String| {
        let language_model = language_model.clone();
        async move {
            let summary = language_model.summarize(&transcript).await?;
            Json::encode(&summary).map_err(|e| ActivityError::Permanent(format!("encode summary: {e}")))
        }
    });

    let embeddings = services.embeddings.clone();
    let search = services.search.clone();
    let language_model = services.language_model.clone();
    builder = builder.register(RAG_QUERY_ACTIVITY, move |input: String| {
        let embeddings = embeddings.clone();
        let search = search.clone();
        let language_model = language_model.clone();
        async move {
            let request: QueryRequest = Json::decode(&input).map_err(|e| decode_err("decode rag_query input", e))?;
            let vectors = embeddings.embed(std::slice::from_ref(&request.query)).await?;
            let vector = vectors
                .into_iter()
                .next()
                .ok_or_else(|| ActivityError::Permanent("embedding service returned no vector".into()))?;
            let hits = search
                .search(
                    &request.index_name,
                    &request.query,
                    &vector,
                    top_k,
                    request.filter.as_deref(),
                )
                .await?;
            let prompt = build_answer_prompt(&request.query, &hits);
            let answer = language_model.answer(&prompt).await?;
            let sources = hits
                .into_iter()
                .map(|h| QuerySource {
                    content: h.content,
                    score: h.score,
                })
                .collect();
            Json::encode(&QueryOutput { answer, sources })
                .map_err(|e| ActivityError::Permanent(format!("encode rag_query result: {e}")))
        }
    });

    builder.build()
}

fn build_answer_prompt(query: &str, hits: &[SearchHit]) -> String {
    let mut prompt = String::from("Answer the question using only the podcast excerpts below.\n\n");
    for (i, hit) in hits.iter().enumerate() {
        prompt.push_str(&format!("Excerpt {}:\n{}\n\n", i + 1, hit.content));
    }
    prompt.push_str(&format!("Question: {query}\nAnswer:"));
    prompt
}
