use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskmillError};

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_SNAPSHOT_PATH: &str = "schedule.json";
pub const DEFAULT_WORK_DIR: &str = "results";
pub const DEFAULT_CONFIG_PATH: &str = "taskmill.toml";
pub const DEFAULT_LOG_FILTER: &str = "taskmill=info,taskmill_scheduler=info,taskmill_jobs=info";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Top-level config (taskmill.toml + TASKMILL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskmillConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool and persistence settings for the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at the same time.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Graceful stop after this many seconds of wall-clock time.
    /// Unset means the loop runs until the roster is exhausted.
    #[serde(default)]
    pub stop_after_secs: Option<f64>,
    /// Where the unfinished roster is written on stop and read on restart.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            stop_after_secs: None,
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl SchedulerConfig {
    /// `None` for unset, non-positive or unrepresentably large values.
    pub fn stop_after(&self) -> Option<Duration> {
        positive_secs(self.stop_after_secs)
    }
}

/// Settings for the default job roster built by the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Scratch directory created first and removed last.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Cities fetched by the weather jobs, one job per city.
    #[serde(default = "default_cities")]
    pub cities: Vec<String>,
    /// Retry budget for every fetch job.
    #[serde(default)]
    pub tries: u32,
    /// Per-job wall-clock budget for fetch jobs. Unset means unbounded.
    #[serde(default)]
    pub max_working_time_secs: Option<f64>,
    /// Base delay between retry attempts, doubled after every failure.
    /// Zero retries immediately.
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            cities: default_cities(),
            tries: 0,
            max_working_time_secs: None,
            retry_backoff_ms: 0,
        }
    }
}

impl JobsConfig {
    pub fn max_working_time(&self) -> Option<Duration> {
        positive_secs(self.max_working_time_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// External forecast provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Request URL with a `{city}` placeholder, e.g.
    /// `https://forecast.example.com/v1/{city}.json`.
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Optional per-city URL overrides, keyed by city name.
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            urls: BTreeMap::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Append log lines to this file instead of stderr.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Open the configured log file for appending, creating parent dirs.
    pub fn open_file(&self) -> Result<Option<File>> {
        let Some(path) = self.file.as_deref() else {
            return Ok(None);
        };
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Some(file))
    }
}

fn positive_secs(secs: Option<f64>) -> Option<Duration> {
    secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|d| !d.is_zero())
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_snapshot_path() -> String {
    DEFAULT_SNAPSHOT_PATH.to_string()
}
fn default_work_dir() -> String {
    DEFAULT_WORK_DIR.to_string()
}
fn default_cities() -> Vec<String> {
    vec!["MOSCOW".to_string(), "GIZA".to_string()]
}
fn default_url_template() -> String {
    "https://code.s3.yandex.net/async-module/{city}-response.json".to_string()
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl TaskmillConfig {
    /// Load config from a TOML file with TASKMILL_* env var overrides.
    ///
    /// Nested keys use a double underscore: `TASKMILL_SCHEDULER__POOL_SIZE=4`.
    /// A missing file is not an error; defaults fill every section.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);

        let config: TaskmillConfig = Figment::from(Serialized::defaults(TaskmillConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TASKMILL_").split("__"))
            .extract()
            .map_err(|e| TaskmillError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.pool_size == 0 {
            return Err(TaskmillError::Config(
                "scheduler.pool_size must be at least 1".to_string(),
            ));
        }
        if !self.weather.url_template.contains("{city}") && self.weather.urls.is_empty() {
            return Err(TaskmillError::Config(
                "weather.url_template must contain a {city} placeholder".to_string(),
            ));
        }
        Ok(())
    }
}
