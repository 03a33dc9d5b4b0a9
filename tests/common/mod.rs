#![allow(dead_code)]

use async_trait::async_trait;
use podflow::activities::{
    pipeline_activities, ActivityError, Collaborators, EmbeddingService, IndexDocument, LanguageModel, ObjectStore,
    SearchHit, SearchIndex, Summary, Transcriber,
};
use podflow::engine::pipeline_workflows;
use podflow::providers::HistoryStore;
use podflow::{Client, Event, PipelineConfig, Runtime};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Poll an instance's history until `pred` holds or the timeout elapses.
pub async fn wait_for_history<F>(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    timeout: std::time::Duration,
    pred: F,
) -> Vec<Event>
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return hist;
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out waiting for history condition; have: {hist:#?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

// ---------------- scripted collaborators ----------------

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, ActivityError> {
        self.objects.lock().await.insert(name.to_string(), bytes);
        Ok(format!("memory://{name}"))
    }

    async fn delete(&self, name: &str) -> Result<(), ActivityError> {
        self.objects.lock().await.remove(name);
        Ok(())
    }
}

/// Transcriber whose poll results are scripted ahead of time. When the
/// script runs out, further polls report "still running".
pub struct ScriptedTranscriber {
    job_id: String,
    polls: Mutex<VecDeque<Result<Option<String>, ActivityError>>>,
    pub start_calls: AtomicU32,
    pub poll_calls: AtomicU32,
}

impl ScriptedTranscriber {
    pub fn new(job_id: impl Into<String>, polls: Vec<Result<Option<String>, ActivityError>>) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            polls: Mutex::new(polls.into()),
            start_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
        })
    }

    /// Job that returns the transcript after `pending` empty polls.
    pub fn completing_after(pending: usize, transcript: &str) -> Arc<Self> {
        let mut polls: Vec<Result<Option<String>, ActivityError>> = vec![Ok(None); pending];
        polls.push(Ok(Some(transcript.to_string())));
        Self::new("job-1", polls)
    }

    /// Job that never finishes.
    pub fn never_completing() -> Arc<Self> {
        Self::new("job-1", Vec::new())
    }

    /// Provider that rejects the job outright: start yields an empty id.
    pub fn rejecting() -> Arc<Self> {
        Self::new("", Vec::new())
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn start(&self, _audio_url: &str, _locale: &str) -> Result<String, ActivityError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.job_id.clone())
    }

    async fn poll(&self, _job_id: &str) -> Result<Option<String>, ActivityError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls.lock().await.pop_front().unwrap_or(Ok(None))
    }
}

/// Deterministic embeddings derived from the text bytes.
#[derive(Default)]
pub struct HashEmbeddings;

#[async_trait]
impl EmbeddingService for HashEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ActivityError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0f32; 8];
                for (i, b) in t.bytes().enumerate() {
                    v[i % 8] += f32::from(b) / 255.0;
                }
                v
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemorySearchIndex {
    indexes: Mutex<HashMap<String, Vec<IndexDocument>>>,
}

impl MemorySearchIndex {
    pub async fn document_count(&self, index: &str) -> usize {
        self.indexes.lock().await.get(index).map(|d| d.len()).unwrap_or(0)
    }

    pub async fn has_index(&self, index: &str) -> bool {
        self.indexes.lock().await.contains_key(index)
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_exists(&self, index: &str) -> Result<(), ActivityError> {
        self.indexes.lock().await.entry(index.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, index: &str, documents: Vec<IndexDocument>) -> Result<usize, ActivityError> {
        let mut g = self.indexes.lock().await;
        let docs = g
            .get_mut(index)
            .ok_or_else(|| ActivityError::Permanent(format!("index not found: {index}")))?;
        let count = documents.len();
        docs.extend(documents);
        Ok(count)
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        _vector: &[f32],
        top_k: usize,
        _filter: Option<&str>,
    ) -> Result<Vec<SearchHit>, ActivityError> {
        let g = self.indexes.lock().await;
        let docs = g
            .get(index)
            .ok_or_else(|| ActivityError::Transient(format!("index not found: {index}")))?;
        // Naive keyword overlap scoring, enough to rank deterministic fixtures
        let words: Vec<&str> = query.split_whitespace().collect();
        let mut hits: Vec<SearchHit> = docs
            .iter()
            .map(|d| {
                let score = words.iter().filter(|w| d.content.contains(**w)).count() as f32;
                SearchHit {
                    content: d.content.clone(),
                    score,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[derive(Clone, Copy)]
pub enum AnswerBehavior {
    Echo,
    AlwaysTransient,
    AlwaysPermanent,
}

pub struct ScriptedLanguageModel {
    behavior: AnswerBehavior,
    pub summarize_calls: AtomicU32,
    pub answer_calls: AtomicU32,
}

impl ScriptedLanguageModel {
    pub fn new(behavior: AnswerBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            summarize_calls: AtomicU32::new(0),
            answer_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn summarize(&self, transcript: &str) -> Result<Summary, ActivityError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Summary {
            summary: format!("summary: {}", transcript.split_whitespace().take(3).collect::<Vec<_>>().join(" ")),
            action_items: vec!["follow up".to_string()],
        })
    }

    async fn answer(&self, prompt: &str) -> Result<String, ActivityError> {
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            AnswerBehavior::Echo => Ok(format!("answer based on: {prompt}")),
            AnswerBehavior::AlwaysTransient => Err(ActivityError::Transient("model overloaded".into())),
            AnswerBehavior::AlwaysPermanent => Err(ActivityError::Permanent("content filtered".into())),
        }
    }
}

// ---------------- harness ----------------

pub struct TestHarness {
    pub runtime: Arc<Runtime>,
    pub client: Client,
    pub store: Arc<dyn HistoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub search: Arc<MemorySearchIndex>,
    pub llm: Arc<ScriptedLanguageModel>,
}

/// Config with intervals short enough for tests.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        poll_interval_ms: 20,
        max_wait_ms: 5_000,
        query_retry: podflow::RetryPolicy::fixed(3, 10),
        ..PipelineConfig::default()
    }
}

pub async fn start_harness(
    store: Arc<dyn HistoryStore>,
    config: PipelineConfig,
    transcriber: Arc<ScriptedTranscriber>,
    llm: Arc<ScriptedLanguageModel>,
) -> TestHarness {
    let objects = Arc::new(MemoryObjectStore::default());
    let search = Arc::new(MemorySearchIndex::default());
    let services = Collaborators {
        object_store: objects.clone(),
        transcriber: transcriber.clone(),
        embeddings: Arc::new(HashEmbeddings),
        search: search.clone(),
        language_model: llm.clone(),
    };
    let activities = pipeline_activities(&config, services);
    let workflows = pipeline_workflows(&config);
    let runtime = Runtime::start_with_store(store.clone(), activities, workflows).await;
    let client = Client::new(runtime.clone(), objects.clone());
    TestHarness {
        runtime,
        client,
        store,
        objects,
        transcriber,
        search,
        llm,
    }
}
