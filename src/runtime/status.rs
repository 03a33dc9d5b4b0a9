use super::Runtime;
use crate::{Event, TRANSCRIPTION_TIMEOUT_ERROR};

/// High-level workflow status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    /// Created, nothing dispatched yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    /// Failed terminal whose error is the transcription timeout.
    TimedOut { error: String },
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed { .. } | WorkflowStatus::Failed { .. } | WorkflowStatus::TimedOut { .. }
        )
    }
}

/// Error type returned by workflow wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

pub fn status_from_history(history: &[Event]) -> WorkflowStatus {
    if history.is_empty() {
        return WorkflowStatus::NotFound;
    }
    for ev in history.iter().rev() {
        match ev {
            Event::InstanceCompleted { output, .. } => {
                return WorkflowStatus::Completed { output: output.clone() }
            }
            Event::InstanceFailed { error, .. } => {
                if error == TRANSCRIPTION_TIMEOUT_ERROR {
                    return WorkflowStatus::TimedOut { error: error.clone() };
                }
                return WorkflowStatus::Failed { error: error.clone() };
            }
            _ => {}
        }
    }
    if history.len() == 1 {
        WorkflowStatus::Pending
    } else {
        WorkflowStatus::Running
    }
}

impl Runtime {
    /// Derive the current status of an instance from its stored history.
    pub async fn get_workflow_status(&self, instance: &str) -> WorkflowStatus {
        let history = self.history_store().read(instance).await;
        status_from_history(&history)
    }

    /// Wait until the workflow reaches a terminal state or the timeout elapses.
    pub async fn wait_for_workflow(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<WorkflowStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        // quick path
        let status = self.get_workflow_status(instance).await;
        if status.is_terminal() {
            return Ok(status);
        }
        // poll with capped backoff
        let mut delay_ms: u64 = 5;
        while std::time::Instant::now() < deadline {
            let status = self.get_workflow_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
        Err(WaitError::Timeout)
    }

    /// Typed variant: decodes the output of a completed workflow.
    pub async fn wait_for_workflow_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        use crate::_typed_codec::Codec as _;
        match self.wait_for_workflow(instance, timeout).await? {
            WorkflowStatus::Completed { output } => match crate::_typed_codec::Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            WorkflowStatus::Failed { error } | WorkflowStatus::TimedOut { error } => Ok(Err(error)),
            _ => unreachable!("wait_for_workflow returns only terminal or timeout"),
        }
    }
}
