//! Durability tests over the filesystem store: restart recovery, idempotent
//! appends, and peek-lock queue behavior.

mod common;

use common::*;
use podflow::engine::transcribe::TranscriptionOutput;
use podflow::providers::{FsHistoryStore, HistoryStore, QueueKind, WorkItem};
use podflow::{Event, PipelineConfig, RetryPolicy, WorkflowStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn workflow_survives_a_runtime_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let config = PipelineConfig {
        poll_interval_ms: 50,
        max_wait_ms: 30_000,
        ..PipelineConfig::default()
    };

    // First host: the transcription job never finishes while this process lives
    {
        let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(&root, false));
        let transcriber = ScriptedTranscriber::never_completing();
        let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
        let h = start_harness(store.clone(), config.clone(), transcriber, llm).await;

        h.client
            .submit_audio_as("crashy", "crashy.mp3", b"audio".to_vec())
            .await
            .unwrap();

        // Let it get into the polling loop: at least one timer fired and a
        // second poll scheduled, then "crash" the host
        wait_for_history(&store, "crashy", Duration::from_secs(10), |hist| {
            hist.iter().any(|e| matches!(e, Event::TimerFired { .. }))
                && hist
                    .iter()
                    .filter(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "check_transcription"))
                    .count()
                    >= 2
        })
        .await;
        h.runtime.shutdown().await;
    }

    // Second host over the same root: the next poll returns the transcript
    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(&root, false));
    // Several identical entries: rehydration may execute the in-flight poll
    // more than once, and every execution should observe the transcript
    let transcriber = ScriptedTranscriber::new(
        "job-1",
        vec![Ok(Some("resumed transcript with plenty of words".to_string())); 4],
    );
    let llm = ScriptedLanguageModel::new(AnswerBehavior::Echo);
    let h = start_harness(store.clone(), config, transcriber, llm).await;

    let status = h.runtime.wait_for_workflow("crashy", Duration::from_secs(15)).await.unwrap();
    let output = match status {
        WorkflowStatus::Completed { output } => output,
        other => panic!("expected completion after restart, got {other:?}"),
    };
    let output: TranscriptionOutput = serde_json::from_str(&output).unwrap();
    assert_eq!(output.index_name, "crashy-index");

    // Replay across the restart never double-scheduled a correlation id and
    // produced exactly one terminal event
    let history = store.read("crashy").await;
    let mut scheduled = HashSet::new();
    for ev in &history {
        if let Event::ActivityScheduled { id, .. } | Event::TimerCreated { id, .. } = ev {
            assert!(scheduled.insert(*id), "correlation id {id} scheduled twice");
        }
    }
    let terminals = history.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);

    // Sequence numbers are contiguous from 1
    for (i, ev) in history.iter().enumerate() {
        assert_eq!(ev.seq(), (i + 1) as u64);
    }

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn duplicate_completion_deliveries_are_absorbed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(dir.path().join("store"), false);

    store.create_instance("i1").await.unwrap();
    store
        .append(
            "i1",
            vec![
                Event::InstanceStarted {
                    seq: 0,
                    workflow: "transcribe_and_index".into(),
                    input: "{}".into(),
                    started_at_ms: 1,
                },
                Event::ActivityScheduled {
                    seq: 0,
                    id: 1,
                    name: "start_transcription".into(),
                    input: "url".into(),
                    retry: RetryPolicy::none(),
                },
            ],
        )
        .await
        .unwrap();

    let completion = Event::ActivityCompleted {
        seq: 0,
        id: 1,
        result: "j1".into(),
    };
    let last = store.append("i1", vec![completion.clone()]).await.unwrap();
    assert_eq!(last, 3);
    // Redelivery after a crash between append and ack
    let last = store.append("i1", vec![completion]).await.unwrap();
    assert_eq!(last, 3);

    let history = store.read("i1").await;
    assert_eq!(history.len(), 3);
    assert_eq!(
        history
            .iter()
            .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn history_is_readable_by_a_fresh_store_handle() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");

    let store = FsHistoryStore::new(&root, false);
    store.create_instance("i1").await.unwrap();
    store
        .append(
            "i1",
            vec![Event::InstanceStarted {
                seq: 0,
                workflow: "rag_query".into(),
                input: "{}".into(),
                started_at_ms: 42,
            }],
        )
        .await
        .unwrap();

    let reopened = FsHistoryStore::new(&root, false);
    let history = reopened.read("i1").await;
    assert_eq!(history.len(), 1);
    assert!(matches!(&history[0], Event::InstanceStarted { started_at_ms: 42, .. }));

    // Duplicate creation is rejected across handles too
    let err = reopened.create_instance("i1").await.unwrap_err();
    assert!(err.contains("already exists"));
}

#[tokio::test]
async fn peek_lock_hides_items_until_ack_or_abandon() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(dir.path().join("store"), false);

    let item = WorkItem::ActivityExecute {
        instance: "i1".into(),
        id: 1,
        name: "summarize".into(),
        input: "text".into(),
        retry: RetryPolicy::none(),
    };
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();
    // Idempotent enqueue: the same item does not queue twice
    store.enqueue_work(QueueKind::Worker, item.clone()).await.unwrap();

    let (got, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(got, item);
    // Locked: nothing else visible
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());

    // Abandon returns it to the front of the queue
    store.abandon(QueueKind::Worker, &token).await.unwrap();
    let (got, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(got, item);

    // Ack removes it for good
    store.ack(QueueKind::Worker, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
}
