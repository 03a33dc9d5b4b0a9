//! Transcription pipeline workflow: start a transcription job, poll it to
//! completion on a durable timer, then chunk/index and summarize the result.

use crate::_typed_codec::{Codec, Json};
use crate::engine::{Steps, Workflow};
use crate::{Action, TRANSCRIPTION_START_ERROR, TRANSCRIPTION_TIMEOUT_ERROR};
use serde::{Deserialize, Serialize};

pub const TRANSCRIBE_AND_INDEX: &str = "transcribe_and_index";

pub const START_TRANSCRIPTION: &str = "start_transcription";
pub const CHECK_TRANSCRIPTION: &str = "check_transcription";
pub const CHUNK_AND_INDEX: &str = "chunk_and_index";
pub const SUMMARIZE: &str = "summarize";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub file_url: String,
    pub podcast_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAndIndexRequest {
    pub index_name: String,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAndIndexResult {
    pub chunks_indexed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeResult {
    pub summary: String,
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub index_name: String,
    pub chunks_indexed: usize,
    pub summary: String,
    pub action_items: Vec<String>,
}

/// Long-running transcription workflow.
///
/// The polling loop is bounded: a wake-up timer is never scheduled to fire
/// after `started_at + max_wait_ms`, and the first poll observed at or past
/// that expiry fails the instance with the timeout error.
pub struct TranscribeAndIndex {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for TranscribeAndIndex {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_wait_ms: 2 * 60 * 60 * 1000,
        }
    }
}

impl Workflow for TranscribeAndIndex {
    fn run(&self, steps: &mut Steps<'_>) -> Result<Action, Action> {
        let request: TranscriptionRequest = steps.input_typed()?;

        let job_id = steps.activity(START_TRANSCRIPTION, request.file_url.clone())?;
        if is_empty_payload(&job_id) {
            return Ok(Action::Fail {
                error: TRANSCRIPTION_START_ERROR.to_string(),
            });
        }

        let expiry = steps.started_at_ms().saturating_add(self.max_wait_ms);
        let transcript = loop {
            let polled = steps.activity(CHECK_TRANSCRIPTION, job_id.clone())?;
            if !is_empty_payload(&polled) {
                break polled;
            }
            if steps.now_ms() >= expiry {
                return Ok(Action::Fail {
                    error: TRANSCRIPTION_TIMEOUT_ERROR.to_string(),
                });
            }
            let fire_at = steps.now_ms().saturating_add(self.poll_interval_ms).min(expiry);
            steps.timer(fire_at)?;
        };

        let index_name = format!("{}-index", request.podcast_id);
        let indexed: ChunkAndIndexResult = steps.activity_typed(
            CHUNK_AND_INDEX,
            &ChunkAndIndexRequest {
                index_name: index_name.clone(),
                transcript: transcript.clone(),
            },
        )?;
        let summarized: SummarizeResult = steps.activity_typed(SUMMARIZE, &transcript)?;

        let output = Json::encode(&TranscriptionOutput {
            index_name,
            chunks_indexed: indexed.chunks_indexed,
            summary: summarized.summary,
            action_items: summarized.action_items,
        })
        .map_err(|e| Action::Fail {
            error: format!("encode workflow output: {e}"),
        })?;
        Ok(Action::Complete { output })
    }
}

/// A pending poll result arrives as an empty string or JSON `null`.
fn is_empty_payload(payload: &str) -> bool {
    let trimmed = payload.trim();
    trimmed.is_empty() || trimmed == "null"
}
