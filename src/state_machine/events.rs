use serde::{Deserialize, Serialize};

/// Events that move a pipeline task between statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Begin an attempt
    Start,
    /// The attempt produced output
    Succeed,
    /// The attempt failed; `retryable` is false once attempts are exhausted
    Fail { error: String, retryable: bool },
    /// Backoff elapsed, start the next attempt
    Resume,
    /// Do not run (upstream failure) or tolerate the failure
    Skip { reason: String },
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail { .. } => "fail",
            Self::Resume => "resume",
            Self::Skip { .. } => "skip",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Events that move an experiment between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentEvent {
    Start,
    /// End time reached
    Complete,
    /// Explicit stop
    Stop,
}

impl ExperimentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Stop => "stop",
        }
    }
}
