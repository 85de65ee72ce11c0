//! Snapshot store: the unfinished roster as a flat JSON array.
//!
//! Each record is one job. Prerequisites are written before their
//! dependents and referenced by `id` from the dependent's `dependencies`
//! array, so the graph can be rebuilt on restore. Files written without ids
//! (or with `"dependencies": null`) load as independent jobs.
//!
//! ```json
//! [
//!   {
//!     "id": "4f0c…",
//!     "name": "CREATE_TEMP_DIR",
//!     "target": "mkdir",
//!     "args": ["results"],
//!     "kwargs": {},
//!     "start_at": "2024-05-01 12:00:00.000000",
//!     "max_working_time": null,
//!     "tries": 3,
//!     "dependencies": null,
//!     "status": "READY"
//!   }
//! ]
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::catalogue::Catalogue;
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobRef};
use crate::types::{JobId, JobStatus};

/// On-disk timestamp layout (local time, microsecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Accepted on read; `%.f` also matches a missing fractional part.
const PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// One persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub name: String,
    /// Symbolic catalogue name of the body.
    pub target: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Map<String, Value>,
    pub start_at: String,
    /// Seconds; `null` means unbounded.
    #[serde(default)]
    pub max_working_time: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tries: u32,
    /// Seconds before the first retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<f64>,
    /// Ids of earlier records; `null` when the job has none.
    #[serde(default)]
    pub dependencies: Option<Vec<JobId>>,
    #[serde(default = "ready")]
    pub status: JobStatus,
}

fn ready() -> JobStatus {
    JobStatus::Ready
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl SnapshotRecord {
    pub fn from_job(job: &Job) -> Self {
        let dependencies: Vec<JobId> = job.dependencies().iter().map(|d| d.id()).collect();
        Self {
            id: Some(job.id()),
            name: job.name().to_string(),
            target: job.target().name().to_string(),
            args: job.args().to_vec(),
            kwargs: job.kwargs().clone(),
            start_at: job.start_at().format(TIMESTAMP_FORMAT).to_string(),
            max_working_time: job.max_working_time().map(|d| d.as_secs_f64()),
            tries: job.tries(),
            retry_backoff: Some(job.retry_backoff())
                .filter(|d| !d.is_zero())
                .map(|d| d.as_secs_f64()),
            dependencies: (!dependencies.is_empty()).then_some(dependencies),
            status: job.status(),
        }
    }

    /// Rebuild a `READY` job from this record, whatever status was saved.
    fn to_job(&self, catalogue: &Catalogue, dependencies: &[JobRef]) -> Result<JobRef> {
        let target = catalogue.resolve(&self.target)?;
        let start_at = parse_timestamp(&self.start_at)
            .ok_or_else(|| self.invalid(format!("bad start_at `{}`", self.start_at)))?;

        let mut builder = Job::builder(self.name.clone(), target)
            .args(self.args.iter().cloned())
            .kwargs(self.kwargs.clone())
            .start_at(start_at)
            .tries(self.tries);
        if let Some(id) = self.id {
            builder = builder.id(id);
        }
        if let Some(secs) = self.max_working_time {
            builder = builder.max_working_time(self.seconds("max_working_time", secs)?);
        }
        if let Some(secs) = self.retry_backoff {
            builder = builder.retry_backoff(self.seconds("retry_backoff", secs)?);
        }
        for dep in dependencies {
            builder = builder.depends_on(dep);
        }
        Ok(builder.build())
    }

    fn seconds(&self, field: &str, secs: f64) -> Result<Duration> {
        Duration::try_from_secs_f64(secs).map_err(|e| self.invalid(format!("{field}: {e}")))
    }

    fn invalid(&self, reason: String) -> SchedulerError {
        SchedulerError::InvalidRecord {
            name: self.name.clone(),
            reason,
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    PARSE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Flatten `roster` into records, each job preceded by its not yet emitted
/// dependency closure (depth first).
pub fn encode<'a, I>(roster: I) -> Vec<SnapshotRecord>
where
    I: IntoIterator<Item = &'a JobRef>,
{
    let mut emitted = HashSet::new();
    let mut records = Vec::new();
    for job in roster {
        emit(job, &mut emitted, &mut records);
    }
    records
}

fn emit(job: &JobRef, emitted: &mut HashSet<JobId>, records: &mut Vec<SnapshotRecord>) {
    if emitted.contains(&job.id()) {
        return;
    }
    for dep in job.dependencies() {
        emit(dep, emitted, records);
    }
    emitted.insert(job.id());
    records.push(SnapshotRecord::from_job(job));
}

/// Rebuild jobs (in record order) with their dependency edges.
///
/// Rejects duplicate ids, edges to ids absent from the file and cycles.
pub fn decode(records: &[SnapshotRecord], catalogue: &Catalogue) -> Result<Vec<JobRef>> {
    let mut index = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        if let Some(id) = record.id {
            if index.insert(id, i).is_some() {
                return Err(record.invalid(format!("duplicate id {id}")));
            }
        }
    }

    let mut decoder = Decoder {
        records,
        index,
        catalogue,
        built: vec![None; records.len()],
        visiting: vec![false; records.len()],
    };
    (0..records.len()).map(|i| decoder.build(i)).collect()
}

struct Decoder<'a> {
    records: &'a [SnapshotRecord],
    index: HashMap<JobId, usize>,
    catalogue: &'a Catalogue,
    built: Vec<Option<JobRef>>,
    visiting: Vec<bool>,
}

impl Decoder<'_> {
    fn build(&mut self, i: usize) -> Result<JobRef> {
        if let Some(job) = &self.built[i] {
            return Ok(Arc::clone(job));
        }
        let records = self.records;
        let record = &records[i];
        if self.visiting[i] {
            return Err(SchedulerError::DependencyCycle {
                job: record.name.clone(),
            });
        }
        self.visiting[i] = true;

        let mut dependencies = Vec::new();
        for dep_id in record.dependencies.iter().flatten() {
            let j = *self
                .index
                .get(dep_id)
                .ok_or_else(|| SchedulerError::UnknownDependency {
                    job: record.name.clone(),
                    dependency: dep_id.to_string(),
                })?;
            dependencies.push(self.build(j)?);
        }

        let job = record.to_job(self.catalogue, &dependencies)?;
        self.visiting[i] = false;
        self.built[i] = Some(Arc::clone(&job));
        Ok(job)
    }
}

/// Write `roster` to `path`, replacing the previous snapshot.
/// Returns the number of records written.
pub fn backup<'a, I>(path: &Path, roster: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a JobRef>,
{
    let records = encode(roster);
    let body = serde_json::to_vec_pretty(&records)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    // write-then-rename so a crash mid-write keeps the previous snapshot
    let tmp = tmp_path(path);
    fs::write(&tmp, body).map_err(|source| io_error(&tmp, source))?;
    fs::rename(&tmp, path).map_err(|source| io_error(path, source))?;

    info!(path = %path.display(), jobs = records.len(), "snapshot written");
    Ok(records.len())
}

/// Read `path` and rebuild its jobs, all in `READY`.
pub fn restore(path: &Path, catalogue: &Catalogue) -> Result<Vec<JobRef>> {
    let body = fs::read(path).map_err(|source| io_error(path, source))?;
    let records: Vec<SnapshotRecord> = serde_json::from_slice(&body)?;
    debug!(path = %path.display(), records = records.len(), "snapshot read");

    let jobs = decode(&records, catalogue)?;
    info!(path = %path.display(), jobs = jobs.len(), "snapshot restored");
    Ok(jobs)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> SchedulerError {
    SchedulerError::Snapshot {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::body_fn;

    fn catalogue() -> Catalogue {
        let mut catalogue = Catalogue::new();
        catalogue.register("mkdir", body_fn(|_ctx| async { Ok(()) }));
        catalogue.register("fetch", body_fn(|_ctx| async { Ok(()) }));
        catalogue
    }

    #[test]
    fn independent_job_round_trip_resets_status() {
        let cat = catalogue();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schedule.json");

        let job = Job::builder("A", cat.resolve("mkdir").unwrap())
            .arg("out")
            .tries(3)
            .max_working_time(Duration::from_millis(250))
            .build();
        job.set_status(JobStatus::Wait).unwrap();

        assert_eq!(backup(&path, [&job]).unwrap(), 1);
        let restored = restore(&path, &cat).unwrap();

        assert_eq!(restored.len(), 1);
        let r = &restored[0];
        assert_eq!(r.name(), "A");
        assert_eq!(r.target().name(), "mkdir");
        assert_eq!(r.args(), &[Value::from("out")]);
        assert_eq!(r.tries(), 3);
        assert_eq!(r.max_working_time(), Some(Duration::from_millis(250)));
        assert_eq!(r.status(), JobStatus::Ready);
        assert_eq!(r.id(), job.id());
        assert_eq!(
            r.start_at().format(TIMESTAMP_FORMAT).to_string(),
            job.start_at().format(TIMESTAMP_FORMAT).to_string()
        );
    }

    #[test]
    fn dependencies_precede_dependents_and_edges_survive() {
        let cat = catalogue();
        let mkdir = Job::builder("mkdir", cat.resolve("mkdir").unwrap()).build();
        let fetch_a = Job::builder("fetch A", cat.resolve("fetch").unwrap())
            .depends_on(&mkdir)
            .build();
        let fetch_b = Job::builder("fetch B", cat.resolve("fetch").unwrap())
            .depends_on(&mkdir)
            .build();
        let last = Job::builder("last", cat.resolve("mkdir").unwrap())
            .depends_on(&mkdir)
            .depends_on(&fetch_a)
            .depends_on(&fetch_b)
            .build();

        let records = encode([&last, &fetch_a]);
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["mkdir", "fetch A", "fetch B", "last"]);
        assert!(records[0].dependencies.is_none());

        let jobs = decode(&records, &cat).unwrap();
        let restored_last = &jobs[3];
        assert_eq!(restored_last.dependencies().len(), 3);
        assert!(Arc::ptr_eq(&restored_last.dependencies()[0], &jobs[0]));
        assert!(Arc::ptr_eq(&jobs[1].dependencies()[0], &jobs[0]));
        assert!(Arc::ptr_eq(&jobs[2].dependencies()[0], &jobs[0]));
    }

    #[test]
    fn legacy_records_load_without_edges() {
        let body = r#"[
            {"name": "CREATE_TEMP_DIR", "args": ["results"], "kwargs": {}, "target": "mkdir",
             "start_at": "2023-03-01 10:15:00", "max_working_time": null, "tries": 3,
             "dependencies": null, "status": "Status.READY"},
            {"name": "WEATHER_GIZA", "args": ["GIZA", "results"], "kwargs": null, "target": "fetch",
             "start_at": "2023-03-01 10:15:00.123456", "max_working_time": 0.5, "tries": 0,
             "dependencies": null, "status": "Status.DONE"}
        ]"#;
        let records: Vec<SnapshotRecord> = serde_json::from_str(body).unwrap();
        let jobs = decode(&records, &catalogue()).unwrap();

        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.dependencies().is_empty()));
        assert!(jobs.iter().all(|j| j.status() == JobStatus::Ready));
        assert_eq!(jobs[1].max_working_time(), Some(Duration::from_millis(500)));
        assert!(jobs[1].kwargs().is_empty());
        assert_ne!(jobs[0].id(), jobs[1].id());
    }

    #[test]
    fn cyclic_records_are_rejected() {
        let a = JobId::new();
        let b = JobId::new();
        let record = |id: JobId, name: &str, dep: JobId| SnapshotRecord {
            id: Some(id),
            name: name.to_string(),
            target: "mkdir".to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            start_at: "2024-01-01 00:00:00.000000".to_string(),
            max_working_time: None,
            tries: 0,
            retry_backoff: None,
            dependencies: Some(vec![dep]),
            status: JobStatus::Ready,
        };

        let err = decode(&[record(a, "a", b), record(b, "b", a)], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyCycle { .. }));

        let err = decode(&[record(a, "self", a)], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyCycle { ref job } if job == "self"));

        let err = decode(&[record(a, "dangling", b)], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownDependency { .. }));
    }

    #[test]
    fn unknown_target_and_bad_values_are_reported() {
        let mut record = SnapshotRecord::from_job(
            &Job::builder("x", catalogue().resolve("mkdir").unwrap()).build(),
        );
        record.target = "teleport".to_string();
        let err = decode(&[record.clone()], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTarget { .. }));

        record.target = "mkdir".to_string();
        record.max_working_time = Some(-1.0);
        let err = decode(&[record.clone()], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRecord { .. }));

        record.max_working_time = None;
        record.start_at = "yesterday".to_string();
        let err = decode(&[record], &catalogue()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRecord { .. }));
    }

    #[test]
    fn missing_and_corrupt_files_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            restore(&missing, &catalogue()).unwrap_err(),
            SchedulerError::Snapshot { .. }
        ));

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, b"{not json").unwrap();
        assert!(matches!(
            restore(&corrupt, &catalogue()).unwrap_err(),
            SchedulerError::SnapshotFormat(_)
        ));
    }

    #[test]
    fn backup_creates_parent_dirs_and_uses_fixed_timestamp_layout() {
        let cat = catalogue();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state/nested/schedule.json");
        let at = parse_timestamp("2024-02-03 04:05:06").unwrap();
        let job = Job::builder("A", cat.resolve("mkdir").unwrap())
            .start_at(at)
            .build();

        backup(&path, [&job]).unwrap();

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["start_at"], "2024-02-03 04:05:06.000000");
        assert_eq!(raw[0]["status"], "READY");
        assert!(raw[0]["dependencies"].is_null());
        assert!(!tmp_path(&path).exists());
    }
}
