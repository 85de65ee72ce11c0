//! Dependency gate: decides whether a popped job may be dispatched.
//!
//! Pure functions over job statuses; re-evaluated every time a job reaches
//! the head of the roster. Cost is O(dependencies) per check.

use crate::job::Job;
use crate::types::JobStatus;

/// Outcome of examining the job at the head of the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Every dependency is `DONE`; dispatch it.
    Ready,
    /// Some dependency is still pending; re-queue at the tail.
    Blocked,
    /// A dependency ended in `ERROR` or `CANCELED`, so this job can never run.
    Unsatisfiable { dependency: String },
    /// The job itself is already terminal; drop it from the roster.
    Settled,
}

/// True iff every dependency has status `DONE`. Jobs without dependencies
/// are always ready.
pub fn is_ready_to_start(job: &Job) -> bool {
    job.dependencies()
        .iter()
        .all(|dep| dep.status() == JobStatus::Done)
}

pub fn evaluate(job: &Job) -> Gate {
    if job.status().is_terminal() {
        return Gate::Settled;
    }
    if let Some(failed) = job
        .dependencies()
        .iter()
        .find(|dep| matches!(dep.status(), JobStatus::Error | JobStatus::Canceled))
    {
        return Gate::Unsatisfiable {
            dependency: failed.name().to_string(),
        };
    }
    if is_ready_to_start(job) {
        Gate::Ready
    } else {
        Gate::Blocked
    }
}
