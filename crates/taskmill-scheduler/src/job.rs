use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::types::{JobId, JobStatus};

/// Shared handle to a job. Dependents and the scheduler roster hold clones;
/// identity (not value equality) decides whether two handles are the same job.
pub type JobRef = Arc<Job>;

/// Longest exponent applied to the retry backoff base delay.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// The executable part of a job.
///
/// Bodies receive their arguments through [`JobContext`] and should poll
/// `ctx.cancel` between steps; the scheduler cancels it when the job's
/// `max_working_time` elapses. A panic counts as a failed attempt.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn call(&self, ctx: JobContext) -> anyhow::Result<()>;
}

struct FnBody<F>(F);

#[async_trait]
impl<F, Fut> JobBody for FnBody<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobBody`].
pub fn body_fn<F, Fut>(f: F) -> Arc<dyn JobBody>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnBody(f))
}

/// A job body together with the symbolic name it is persisted under.
#[derive(Clone)]
pub struct Target {
    name: String,
    body: Arc<dyn JobBody>,
}

impl Target {
    pub fn new(name: impl Into<String>, body: Arc<dyn JobBody>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Target").field(&self.name).finish()
    }
}

/// Everything a body sees for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub args: Arc<Vec<Value>>,
    pub kwargs: Arc<Map<String, Value>>,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Look up a parameter by keyword first, then by position.
    pub fn param(&self, position: usize, key: &str) -> Option<&Value> {
        self.kwargs.get(key).or_else(|| self.args.get(position))
    }

    /// Like [`param`](Self::param) but requires a string value.
    pub fn str_param(&self, position: usize, key: &str) -> anyhow::Result<&str> {
        let value = self
            .param(position, key)
            .ok_or_else(|| anyhow!("missing argument `{key}` (position {position})"))?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("argument `{key}` must be a string, got {value}"))
    }
}

/// What one dispatch of [`Job::run`] amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Total invocations of the target, the first one included.
    pub attempts: u32,
    /// Retry budget left afterwards.
    pub tries_left: u32,
    /// Last failure message when every attempt failed.
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A unit of schedulable work.
///
/// `status` is only changed by the scheduler's control loop, through the
/// state machine in [`JobStatus::can_transition_to`]. `tries` is owned by the
/// job itself and only ever decreases.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    name: String,
    target: Target,
    args: Arc<Vec<Value>>,
    kwargs: Arc<Map<String, Value>>,
    start_at: NaiveDateTime,
    max_working_time: Option<Duration>,
    retry_backoff: Duration,
    tries: AtomicU32,
    dependencies: Vec<JobRef>,
    status: RwLock<JobStatus>,
    /// Cancellation token of the attempt currently executing, if any.
    current: Mutex<Option<CancellationToken>>,
}

impl Job {
    pub fn builder(name: impl Into<String>, target: Target) -> JobBuilder {
        JobBuilder::new(name, target)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn start_at(&self) -> NaiveDateTime {
        self.start_at
    }

    pub fn max_working_time(&self) -> Option<Duration> {
        self.max_working_time
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Remaining retry budget.
    pub fn tries(&self) -> u32 {
        self.tries.load(Ordering::SeqCst)
    }

    pub fn dependencies(&self) -> &[JobRef] {
        &self.dependencies
    }

    pub fn status(&self) -> JobStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the state machine allows it. Returns the old status.
    pub(crate) fn set_status(&self, next: JobStatus) -> Result<JobStatus> {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        let prev = *status;
        if !prev.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                job: self.name.clone(),
                from: prev,
                to: next,
            });
        }
        *status = next;
        Ok(prev)
    }

    /// Time left until `start_at`, or `None` when the job may start now.
    pub fn start_delay(&self) -> Option<Duration> {
        (self.start_at - Local::now().naive_local()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Execute the target, retrying inline while the budget allows.
    ///
    /// Failures never escape: they are logged and folded into the report.
    /// Each retry decrements `tries` before it is attempted. Once `cancel`
    /// fires no further attempt is started.
    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        let started = Instant::now();
        self.set_current(Some(cancel.clone()));
        // cleared on return and when the run is aborted mid-attempt
        let _current = CurrentAttempt(self);

        let mut attempts = 0u32;
        let error = loop {
            attempts += 1;
            let ctx = self.context(attempts, cancel.clone());
            let call = AssertUnwindSafe(self.target.body.call(ctx)).catch_unwind();
            let message = match call.await {
                Ok(Ok(())) => {
                    if attempts > 1 {
                        info!(job = %self.name, attempts, "job succeeded after retry");
                    }
                    break None;
                }
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => format!("job body panicked: {}", panic_message(panic.as_ref())),
            };

            if attempts == 1 {
                error!(job = %self.name, target = %self.target.name, error = %message, "job failed");
            } else {
                error!(job = %self.name, attempt = attempts, error = %message, "job failed after retry");
            }

            if cancel.is_cancelled() {
                warn!(job = %self.name, "job cancelled, no further retries");
                break Some(message);
            }
            let Ok(budget) = self
                .tries
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(1))
            else {
                break Some(message);
            };
            warn!(job = %self.name, tries = budget, "retrying job after failure");

            if !self.retry_backoff.is_zero() {
                let delay = self
                    .retry_backoff
                    .saturating_mul(1u32 << (attempts - 1).min(MAX_BACKOFF_SHIFT));
                debug!(job = %self.name, delay_ms = delay.as_millis() as u64, "retry backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        warn!(job = %self.name, "job cancelled during retry backoff");
                        break Some(message);
                    }
                }
            }
        };

        info!(
            job = %self.name,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job run finished"
        );

        RunReport {
            attempts,
            tries_left: self.tries(),
            error,
        }
    }

    /// Reserved lifecycle hook. Jobs cannot be suspended mid-attempt.
    pub fn pause(&self) {
        debug!(job = %self.name, "pause requested; not supported, ignoring");
    }

    /// Ask the running attempt to stop by cancelling its token.
    ///
    /// Cooperative only: a body that never checks `ctx.cancel` keeps running.
    pub fn stop(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(token) => {
                info!(job = %self.name, "stop requested, cancelling current attempt");
                token.cancel();
            }
            None => debug!(job = %self.name, "stop requested while idle"),
        }
    }

    fn set_current(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn context(&self, attempt: u32, cancel: CancellationToken) -> JobContext {
        JobContext {
            job_id: self.id,
            job_name: self.name.clone(),
            args: Arc::clone(&self.args),
            kwargs: Arc::clone(&self.kwargs),
            attempt,
            cancel,
        }
    }
}

struct CurrentAttempt<'a>(&'a Job);

impl Drop for CurrentAttempt<'_> {
    fn drop(&mut self) {
        self.0.set_current(None);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.target.name)
    }
}

/// Builder for [`Job`]. Dependencies must exist before the dependent is
/// built, so graphs constructed this way are acyclic.
#[derive(Debug)]
pub struct JobBuilder {
    id: Option<JobId>,
    name: String,
    target: Target,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    start_at: Option<NaiveDateTime>,
    max_working_time: Option<Duration>,
    retry_backoff: Duration,
    tries: u32,
    dependencies: Vec<JobRef>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        Self {
            id: None,
            name: name.into(),
            target,
            args: Vec::new(),
            kwargs: Map::new(),
            start_at: None,
            max_working_time: None,
            retry_backoff: Duration::ZERO,
            tries: 0,
            dependencies: Vec::new(),
        }
    }

    pub(crate) fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    /// Earliest local time the job may start. Defaults to the build time.
    pub fn start_at(mut self, at: NaiveDateTime) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn max_working_time(mut self, limit: Duration) -> Self {
        self.max_working_time = Some(limit);
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Delay before the first retry; doubled for every following one.
    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    pub fn depends_on(mut self, dependency: &JobRef) -> Self {
        self.dependencies.push(Arc::clone(dependency));
        self
    }

    pub fn build(self) -> JobRef {
        Arc::new(Job {
            id: self.id.unwrap_or_default(),
            name: self.name,
            target: self.target,
            args: Arc::new(self.args),
            kwargs: Arc::new(self.kwargs),
            start_at: self.start_at.unwrap_or_else(|| Local::now().naive_local()),
            max_working_time: self.max_working_time,
            retry_backoff: self.retry_backoff,
            tries: AtomicU32::new(self.tries),
            dependencies: self.dependencies,
            status: RwLock::new(JobStatus::Ready),
            current: Mutex::new(None),
        })
    }
}
