use std::path::PathBuf;

use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the scheduler subsystem.
///
/// Failures inside job bodies never show up here; they end as a job status.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The snapshot file could not be read or written.
    #[error("Snapshot I/O error at {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file is not a valid JSON array of job records.
    #[error("Snapshot format error: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    /// A snapshot record names a target missing from the catalogue.
    #[error("Unknown job target: {name}")]
    UnknownTarget { name: String },

    /// A snapshot record depends on an id no record in the file carries.
    #[error("Job {job} depends on unknown job id {dependency}")]
    UnknownDependency { job: String, dependency: String },

    /// Snapshot dependency edges loop back onto this job.
    #[error("Dependency cycle detected at job {job}")]
    DependencyCycle { job: String },

    /// A snapshot record carries a value that cannot be turned into a job.
    #[error("Invalid job record {name}: {reason}")]
    InvalidRecord { name: String, reason: String },

    /// `restart` was called while the dispatch loop is active.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// A status change outside the job state machine was attempted.
    #[error("Invalid status transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
