use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a job, used to link dependency edges in snapshots.
///
/// Names are not required to be unique, so the scheduler never matches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Serialised in upper case (`"READY"`); the `Status.READY` spelling written
/// by older snapshot files is accepted on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Registered, not yet examined by the dispatch loop.
    #[serde(alias = "Status.READY")]
    Ready,
    /// Re-queued because at least one dependency is not `DONE`.
    #[serde(alias = "Status.WAIT")]
    Wait,
    /// Handed to a worker.
    #[serde(alias = "Status.EXEC")]
    Exec,
    /// Finished successfully.
    #[serde(alias = "Status.DONE")]
    Done,
    /// Failed and ran out of retries.
    #[serde(alias = "Status.ERROR")]
    Error,
    /// Timed out, or can never run because a dependency failed.
    #[serde(alias = "Status.CANCELED")]
    Canceled,
}

impl JobStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in `WAIT` is allowed so a re-queued job can fail its gate again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Ready, Wait)
                | (Wait, Wait)
                | (Ready, Exec)
                | (Wait, Exec)
                | (Exec, Done)
                | (Exec, Error)
                | (Exec, Canceled)
                | (Ready, Canceled)
                | (Wait, Canceled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Ready => "READY",
            JobStatus::Wait => "WAIT",
            JobStatus::Exec => "EXEC",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
            JobStatus::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.strip_prefix("Status.").unwrap_or(s) {
            "READY" => Ok(JobStatus::Ready),
            "WAIT" => Ok(JobStatus::Wait),
            "EXEC" => Ok(JobStatus::Exec),
            "DONE" => Ok(JobStatus::Done),
            "ERROR" => Ok(JobStatus::Error),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}
