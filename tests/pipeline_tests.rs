//! End-to-end pipeline tests over the in-memory store with scripted
//! collaborators.

mod common;

use common::*;
use podflow::activities::{IndexDocument, SearchIndex};
use podflow::engine::query::QueryOutput;
use podflow::engine::transcribe::TranscriptionOutput;
use podflow::providers::{HistoryStore, InMemoryHistoryStore, QueueKind, WorkItem};
use podflow::{ClientError, Event, PipelineConfig, RetryPolicy, WorkflowStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn in_memory() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::default())
}

#[tokio::test]
async fn transcription_pipeline_completes() {
    let transcriber = ScriptedTranscriber::completing_after(2, "hello world from the show");
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber.clone(), llm).await;

    h.client
        .submit_audio_as("ep1", "episode1.mp3", b"audio-bytes".to_vec())
        .await
        .unwrap();

    let status = h.client.wait("ep1", Duration::from_secs(10)).await.unwrap();
    let output = match status {
        WorkflowStatus::Completed { output } => output,
        other => panic!("expected completion, got {other:?}"),
    };
    let output: TranscriptionOutput = serde_json::from_str(&output).unwrap();
    assert_eq!(output.index_name, "episode1-index");
    assert!(output.chunks_indexed >= 1);
    assert!(output.summary.starts_with("summary:"));
    assert_eq!(output.action_items, vec!["follow up".to_string()]);

    // The index actually received the chunks
    assert!(h.search.has_index("episode1-index").await);
    assert_eq!(h.search.document_count("episode1-index").await, output.chunks_indexed);

    // Two pending polls means exactly two durable timer wake-ups
    let history = h.store.read("ep1").await;
    let fired = history
        .iter()
        .filter(|e| matches!(e, Event::TimerFired { .. }))
        .count();
    assert_eq!(fired, 2);
    assert_eq!(transcriber.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transcriber.poll_calls.load(Ordering::SeqCst), 3);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn stalled_transcription_times_out() {
    let transcriber = ScriptedTranscriber::never_completing();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let config = PipelineConfig {
        poll_interval_ms: 20,
        max_wait_ms: 100,
        ..PipelineConfig::default()
    };
    let h = start_harness(in_memory(), config, transcriber, llm).await;

    h.client
        .submit_audio_as("stalled", "stalled.mp3", b"audio".to_vec())
        .await
        .unwrap();

    let status = h.client.wait("stalled", Duration::from_secs(10)).await.unwrap();
    assert!(matches!(status, WorkflowStatus::TimedOut { .. }));

    // No wake-up was ever scheduled past the expiry boundary
    let history = h.store.read("stalled").await;
    let started_at = history
        .iter()
        .find_map(|e| match e {
            Event::InstanceStarted { started_at_ms, .. } => Some(*started_at_ms),
            _ => None,
        })
        .unwrap();
    for ev in &history {
        if let Event::TimerCreated { fire_at_ms, .. } = ev {
            assert!(
                *fire_at_ms <= started_at + 100,
                "timer scheduled past expiry: {fire_at_ms} > {}",
                started_at + 100
            );
        }
    }

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn rejected_job_fails_without_timers() {
    let transcriber = ScriptedTranscriber::rejecting();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm).await;

    h.client
        .submit_audio_as("rejected", "rejected.mp3", b"audio".to_vec())
        .await
        .unwrap();

    let status = h.client.wait("rejected", Duration::from_secs(10)).await.unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert!(error.contains("could not be started")),
        other => panic!("expected failure, got {other:?}"),
    }
    let history = h.store.read("rejected").await;
    assert!(!history.iter().any(|e| matches!(e, Event::TimerCreated { .. })));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_is_rejected_and_history_untouched() {
    let transcriber = ScriptedTranscriber::completing_after(0, "short transcript");
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm).await;

    h.client
        .submit_audio_as("dup", "first.mp3", b"audio".to_vec())
        .await
        .unwrap();
    let status = h.client.wait("dup", Duration::from_secs(10)).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));
    let before = h.store.read("dup").await;

    let err = h
        .client
        .submit_audio_as("dup", "second.mp3", b"other-audio".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::DuplicateInstance("dup".to_string()));

    let after = h.store.read("dup").await;
    assert_eq!(before, after);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_instance_exists() {
    let transcriber = ScriptedTranscriber::never_completing();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm).await;

    let err = h.client.submit_audio("   ", b"audio".to_vec()).await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));

    let err = h
        .client
        .submit_audio_as("e1", "episode.mp3", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));

    let err = h.client.submit_query("   ", "ep1-index", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));

    assert!(h.store.list_instances().await.is_empty());
    assert_eq!(h.client.status("e1").await, WorkflowStatus::NotFound);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn transient_query_failure_is_retried_exactly_to_budget() {
    let transcriber = ScriptedTranscriber::never_completing();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::AlwaysTransient);
    let config = PipelineConfig {
        query_retry: RetryPolicy::fixed(3, 10),
        ..fast_config()
    };
    let h = start_harness(in_memory(), config, transcriber, llm.clone()).await;
    h.search.ensure_exists("ep1-index").await.unwrap();

    h.client
        .submit_query_as("q1", "what happened", "ep1-index", None)
        .await
        .unwrap();
    let status = h.client.wait("q1", Duration::from_secs(10)).await.unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert!(error.contains("model overloaded")),
        other => panic!("expected failure, got {other:?}"),
    }
    // Three invocations total: first attempt plus two retries
    assert_eq!(llm.answer_calls.load(Ordering::SeqCst), 3);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn permanent_query_failure_is_not_retried() {
    let transcriber = ScriptedTranscriber::never_completing();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::AlwaysPermanent);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm.clone()).await;
    h.search.ensure_exists("ep1-index").await.unwrap();

    h.client
        .submit_query_as("q1", "what happened", "ep1-index", None)
        .await
        .unwrap();
    let status = h.client.wait("q1", Duration::from_secs(10)).await.unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert!(error.contains("content filtered")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(llm.answer_calls.load(Ordering::SeqCst), 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn stale_completion_for_terminal_instance_does_not_block_the_queue() {
    // Both instances poll against the same script; every poll finds the transcript
    let transcriber = ScriptedTranscriber::new("job-1", vec![Ok(Some("short transcript".to_string())); 4]);
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm).await;

    h.client
        .submit_audio_as("done", "done.mp3", b"audio".to_vec())
        .await
        .unwrap();
    let status = h.client.wait("done", Duration::from_secs(10)).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    // Redelivered duplicate after the instance already reached its terminal
    // event; it must be dropped, not retried at the head of the queue
    h.store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::ActivityCompleted {
                instance: "done".into(),
                id: 2,
                result: "null".into(),
            },
        )
        .await
        .unwrap();

    h.client
        .submit_audio_as("fresh", "fresh.mp3", b"more-audio".to_vec())
        .await
        .unwrap();
    let status = h.client.wait("fresh", Duration::from_secs(10)).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Completed { .. }));

    // The stale item was consumed, and the terminal history is unchanged
    assert!(h.store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    let history = h.store.read("done").await;
    assert_eq!(history.iter().filter(|e| e.is_terminal()).count(), 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn rag_query_answers_from_indexed_chunks() {
    let transcriber = ScriptedTranscriber::never_completing();
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(in_memory(), fast_config(), transcriber, llm).await;

    h.search.ensure_exists("ep1-index").await.unwrap();
    h.search
        .upsert(
            "ep1-index",
            vec![
                IndexDocument {
                    id: "ep1-index-0".into(),
                    content: "the guest discussed durable execution".into(),
                    vector: vec![0.1; 8],
                },
                IndexDocument {
                    id: "ep1-index-1".into(),
                    content: "closing remarks and thanks".into(),
                    vector: vec![0.2; 8],
                },
            ],
        )
        .await
        .unwrap();

    let instance = h
        .client
        .submit_query("durable execution", "ep1-index", None)
        .await
        .unwrap();
    let status = h.client.wait(&instance, Duration::from_secs(10)).await.unwrap();
    let output = match status {
        WorkflowStatus::Completed { output } => output,
        other => panic!("expected completion, got {other:?}"),
    };
    let output: QueryOutput = serde_json::from_str(&output).unwrap();
    assert!(output.answer.contains("durable execution"));
    assert!(!output.sources.is_empty());
    assert_eq!(output.sources[0].content, "the guest discussed durable execution");

    h.runtime.shutdown().await;
}
