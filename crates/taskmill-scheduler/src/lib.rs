//! `taskmill-scheduler`: dependency-aware job scheduler with a bounded
//! Tokio worker pool and JSON snapshot persistence.
//!
//! # Overview
//!
//! Jobs are registered into the [`engine::Scheduler`] roster together with
//! everything they depend on. The dispatch loop pops jobs in FIFO order,
//! re-queues the ones whose prerequisites are not `DONE` yet, and hands the
//! rest to at most `pool_size` concurrent workers. Each job carries its own
//! retry budget and an optional wall-clock limit.
//!
//! # Job lifecycle
//!
//! | From            | To         | When                                        |
//! |-----------------|------------|---------------------------------------------|
//! | `READY`         | `WAIT`     | a dependency is not `DONE` yet              |
//! | `READY`/`WAIT`  | `EXEC`     | every dependency is `DONE`                  |
//! | `EXEC`          | `DONE`     | the target (with retries) succeeded in time |
//! | `EXEC`          | `ERROR`    | the retry budget is exhausted               |
//! | `EXEC`          | `CANCELED` | `max_working_time` elapsed                  |
//! | `READY`/`WAIT`  | `CANCELED` | a dependency ended in `ERROR`/`CANCELED`    |
//!
//! On a graceful stop the unfinished roster is written to a snapshot file
//! ([`snapshot`]) and can be restored into a fresh scheduler later.

pub mod catalogue;
pub mod engine;
pub mod error;
pub mod gate;
pub mod job;
pub mod snapshot;
pub mod types;

pub use catalogue::Catalogue;
pub use engine::{RunSummary, Scheduler, StopHandle};
pub use error::{Result, SchedulerError};
pub use gate::{is_ready_to_start, Gate};
pub use job::{body_fn, Job, JobBody, JobBuilder, JobContext, JobRef, RunReport, Target};
pub use types::{JobId, JobStatus};
