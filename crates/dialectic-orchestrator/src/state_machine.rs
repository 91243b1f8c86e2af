//! Pure job lifecycle state machine
//!
//! No async and no I/O. `pending -> processing -> retrying* -> terminal`.
//! Invalid transitions go to `failed` and never panic.

use serde::{Deserialize, Serialize};

/// Status of a generation job, as written to the jobs table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    RetryLoopFailed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::RetryLoopFailed => "retry_loop_failed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RetryLoopFailed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a job between statuses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A worker picked the job up
    Start,
    /// Another attempt begins for the models that are left
    Retry { attempt: u32 },
    /// Every model produced a saved contribution
    AllSucceeded,
    /// Attempts ran out with at least one model still failing
    RetriesExhausted,
    /// Cancelled between attempts or continuation calls
    Cancel,
    /// Missing session, project or prompt, or an invalid payload
    Unrecoverable { reason: String },
}

/// Pure transition function
pub fn transition(status: JobStatus, event: JobEvent) -> JobStatus {
    use JobStatus::*;

    match (status, event) {
        (Pending, JobEvent::Start) => Processing,

        (Processing | Retrying, JobEvent::Retry { .. }) => Retrying,
        (Processing | Retrying, JobEvent::AllSucceeded) => Completed,
        (Processing | Retrying, JobEvent::RetriesExhausted) => RetryLoopFailed,

        (Pending | Processing | Retrying, JobEvent::Cancel) => Failed,
        (Pending | Processing | Retrying, JobEvent::Unrecoverable { .. }) => Failed,

        // Terminal states and everything else
        _ => Failed,
    }
}
