use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskmill_core::config::SchedulerConfig;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalogue::Catalogue,
    error::{Result, SchedulerError},
    gate::{self, Gate},
    job::{Job, JobRef, RunReport},
    snapshot,
    types::JobStatus,
};

/// Cloneable handle for stopping a running [`Scheduler`] from another task.
#[derive(Clone)]
pub struct StopHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the dispatch loop to stop gracefully: nothing new is dispatched,
    /// in-flight jobs are awaited, then the remaining roster is persisted.
    pub fn request_stop(&self) {
        info!("scheduler stop requested");
        self.stop_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Counters for one [`Scheduler::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Jobs left in the roster when the loop exited.
    pub remaining: usize,
    pub elapsed: Duration,
    /// True when the loop exited on `stop_after` or a [`StopHandle`].
    pub stopped: bool,
}

/// Dependency-aware dispatcher over a FIFO roster and a bounded worker pool.
///
/// The control loop is the only writer of the roster and of job statuses;
/// workers report back through a oneshot channel per dispatch.
pub struct Scheduler {
    pool_size: usize,
    snapshot_path: PathBuf,
    catalogue: Catalogue,
    roster: VecDeque<JobRef>,
    slots: Arc<Semaphore>,
    stop_tx: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, catalogue: Catalogue) -> Self {
        let pool_size = config.pool_size.max(1);
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool_size,
            snapshot_path: PathBuf::from(&config.snapshot_path),
            catalogue,
            roster: VecDeque::new(),
            slots: Arc::new(Semaphore::new(pool_size)),
            stop_tx: Arc::new(stop_tx),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Jobs not yet dispatched, in dispatch order.
    pub fn roster(&self) -> &VecDeque<JobRef> {
        &self.roster
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: Arc::clone(&self.stop_tx),
            running: Arc::clone(&self.running),
        }
    }

    /// Append `job` to the roster, registering its dependencies first.
    ///
    /// Jobs already present (same reference) are skipped, so registering a
    /// job twice, or two jobs sharing a dependency, is harmless.
    pub fn add_to_schedule(&mut self, job: &JobRef) {
        for dep in job.dependencies() {
            self.add_to_schedule(dep);
        }
        if self.roster.iter().any(|queued| Arc::ptr_eq(queued, job)) {
            debug!(job = %job.name(), "job already scheduled");
            return;
        }
        info!(
            job = %job.name(),
            job_id = %job.id(),
            dependencies = job.dependencies().len(),
            "job added to schedule"
        );
        self.roster.push_back(Arc::clone(job));
    }

    /// Drive the roster until it is exhausted or a stop condition fires.
    ///
    /// `stop_after` bounds the wall-clock time of the loop; when it elapses
    /// (or [`StopHandle::request_stop`] is called) in-flight jobs are awaited
    /// and the unfinished roster is written to the snapshot path. Job failures
    /// never end the loop; only snapshot I/O errors are returned.
    pub async fn run(&mut self, stop_after: Option<Duration>) -> Result<RunSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("run requested while the scheduler is already running");
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = RunningGuard(Arc::clone(&self.running));

        let started = Instant::now();
        // too far out to represent means no deadline
        let deadline = stop_after.and_then(|limit| started.checked_add(limit));
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let mut in_flight: JoinSet<Settled> = JoinSet::new();
        let mut summary = RunSummary::default();
        // consecutive pops that re-queued a blocked job without any progress
        let mut idle_pops = 0usize;

        info!(
            jobs = self.roster.len(),
            pool_size = self.pool_size,
            stop_after_ms = stop_after.map(|d| d.as_millis() as u64),
            "scheduler started"
        );

        loop {
            if self.roster.is_empty() && in_flight.is_empty() {
                break;
            }
            if *stop_rx.borrow() || deadline.is_some_and(|d| Instant::now() >= d) {
                summary.stopped = true;
                break;
            }

            let can_pop = !self.roster.is_empty() && idle_pops < self.roster.len();
            if !can_pop && in_flight.is_empty() {
                cancel_stalled(&mut self.roster, &mut summary);
                break;
            }

            tokio::select! {
                biased;
                _ = stop_rx.changed() => {}
                _ = sleep_until(deadline) => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    idle_pops = 0;
                    match joined {
                        Ok(settled) => settle(settled, &mut summary),
                        Err(e) => error!(error = %e, "job supervisor task failed"),
                    }
                }
                permit = Arc::clone(&self.slots).acquire_owned(), if can_pop => {
                    let Ok(permit) = permit else {
                        error!("worker pool closed, stopping dispatch");
                        break;
                    };
                    let Some(job) = self.roster.pop_front() else {
                        continue;
                    };
                    match gate::evaluate(&job) {
                        Gate::Ready => {
                            idle_pops = 0;
                            dispatch(job, permit, &mut in_flight);
                        }
                        Gate::Blocked => {
                            drop(permit);
                            park(&job);
                            self.roster.push_back(job);
                            idle_pops += 1;
                        }
                        Gate::Unsatisfiable { dependency } => {
                            idle_pops = 0;
                            warn!(
                                job = %job.name(),
                                %dependency,
                                "dependency did not complete, canceling job"
                            );
                            mark(&job, JobStatus::Canceled);
                            summary.canceled += 1;
                        }
                        Gate::Settled => {
                            idle_pops = 0;
                            debug!(job = %job.name(), status = %job.status(), "job already settled, dropped");
                        }
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(settled) => settle(settled, &mut summary),
                Err(e) => error!(error = %e, "job supervisor task failed"),
            }
        }

        summary.remaining = self.roster.len();
        summary.elapsed = started.elapsed();
        info!(
            done = summary.done,
            failed = summary.failed,
            canceled = summary.canceled,
            remaining = summary.remaining,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scheduler finished"
        );

        if summary.stopped {
            self.stop()?;
        }
        Ok(summary)
    }

    /// Persist the remaining roster to the snapshot path and signal any
    /// running loop to stop. Returns the number of records written.
    pub fn stop(&mut self) -> Result<usize> {
        self.stop_tx.send_replace(true);
        let written = self.backup(&self.snapshot_path)?;
        info!(path = %self.snapshot_path.display(), jobs = written, "scheduler stopped");
        Ok(written)
    }

    /// Restore the snapshot and run it. Refused while a run is active.
    pub async fn restart(&mut self, stop_after: Option<Duration>) -> Result<RunSummary> {
        if self.is_running() {
            warn!("restart requested while the scheduler is running");
            return Err(SchedulerError::AlreadyRunning);
        }
        let path = self.snapshot_path.clone();
        let restored = self.restore(&path)?;
        info!(path = %path.display(), jobs = restored, "scheduler restarting from snapshot");
        self.run(stop_after).await
    }

    /// Write the roster (with dependency closures) to `path`.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<usize> {
        snapshot::backup(path.as_ref(), &self.roster)
    }

    /// Load `path` and register every restored job. On error the roster is
    /// left untouched.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let jobs = snapshot::restore(path.as_ref(), &self.catalogue)?;
        for job in &jobs {
            self.add_to_schedule(job);
        }
        Ok(jobs.len())
    }
}

/// Clears the running flag even when the `run` future is dropped early.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Completed { attempts: u32 },
    Failed { attempts: u32, error: String },
    TimedOut(Duration),
    /// The worker went away without a report (its body panicked).
    Lost,
}

impl Outcome {
    fn from_report(received: std::result::Result<RunReport, oneshot::error::RecvError>) -> Self {
        match received {
            Ok(report) => match report.error {
                None => Outcome::Completed {
                    attempts: report.attempts,
                },
                Some(error) => Outcome::Failed {
                    attempts: report.attempts,
                    error,
                },
            },
            Err(_) => Outcome::Lost,
        }
    }
}

struct Settled {
    job: JobRef,
    outcome: Outcome,
    elapsed: Duration,
}

fn dispatch(job: JobRef, permit: OwnedSemaphorePermit, in_flight: &mut JoinSet<Settled>) {
    if let Err(e) = job.set_status(JobStatus::Exec) {
        error!(job = %job.name(), error = %e, "job cannot be dispatched");
        return;
    }
    info!(job = %job.name(), target = %job.target().name(), "job dispatched");
    in_flight.spawn(supervise(job, permit));
}

/// Wait out the start delay, run the job on its own task and wait for its
/// report within `max_working_time`. On timeout the worker is aborted at its
/// next await point and joined, so the slot is only released once the body
/// has stopped.
async fn supervise(job: JobRef, permit: OwnedSemaphorePermit) -> Settled {
    let _permit = permit;

    if let Some(delay) = job.start_delay() {
        info!(job = %job.name(), delay_ms = delay.as_millis() as u64, "job start delayed");
        tokio::time::sleep(delay).await;
    }

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let (report_tx, report_rx) = oneshot::channel();
    let worker = Arc::clone(&job);
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let report = worker.run(token).await;
        let _ = report_tx.send(report);
    });

    let outcome = match job.max_working_time() {
        Some(limit) => match tokio::time::timeout(limit, report_rx).await {
            Ok(received) => Outcome::from_report(received),
            Err(_) => {
                cancel.cancel();
                handle.abort();
                if let Err(e) = handle.await {
                    debug!(job = %job.name(), cancelled = e.is_cancelled(), "timed out worker joined");
                }
                Outcome::TimedOut(limit)
            }
        },
        None => Outcome::from_report(report_rx.await),
    };

    Settled {
        job,
        outcome,
        elapsed: started.elapsed(),
    }
}

fn settle(settled: Settled, summary: &mut RunSummary) {
    let Settled {
        job,
        outcome,
        elapsed,
    } = settled;
    let elapsed_ms = elapsed.as_millis() as u64;

    let status = match outcome {
        Outcome::Completed { attempts } => {
            info!(job = %job.name(), attempts, elapsed_ms, "job done");
            summary.done += 1;
            JobStatus::Done
        }
        Outcome::Failed { attempts, error } => {
            error!(job = %job.name(), attempts, elapsed_ms, %error, "job failed, retries exhausted");
            summary.failed += 1;
            JobStatus::Error
        }
        Outcome::TimedOut(limit) => {
            warn!(
                job = %job.name(),
                limit_ms = limit.as_millis() as u64,
                "job exceeded max_working_time, canceled"
            );
            summary.canceled += 1;
            JobStatus::Canceled
        }
        Outcome::Lost => {
            error!(job = %job.name(), elapsed_ms, "job worker ended without a report");
            summary.failed += 1;
            JobStatus::Error
        }
    };
    mark(&job, status);
}

fn park(job: &Job) {
    match job.set_status(JobStatus::Wait) {
        Ok(JobStatus::Ready) => info!(job = %job.name(), "dependencies pending, job waiting"),
        Ok(_) => debug!(job = %job.name(), "job still waiting on dependencies"),
        Err(e) => error!(job = %job.name(), error = %e, "cannot park job"),
    }
}

fn mark(job: &Job, status: JobStatus) {
    if let Err(e) = job.set_status(status) {
        error!(job = %job.name(), error = %e, "status update rejected");
    }
}

/// Every queued job is blocked and nothing is running, so none of them can
/// ever become ready.
fn cancel_stalled(roster: &mut VecDeque<JobRef>, summary: &mut RunSummary) {
    warn!(jobs = roster.len(), "no queued job can make progress, canceling the rest");
    for job in roster.drain(..) {
        mark(&job, JobStatus::Canceled);
        summary.canceled += 1;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
