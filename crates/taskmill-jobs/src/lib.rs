//! `taskmill-jobs`: the job bodies taskmill can run by name, and the
//! default roster wired from them.
//!
//! | Target          | Arguments          | Effect                                   |
//! |-----------------|--------------------|------------------------------------------|
//! | `mkdir`         | `temp_dir`         | create the directory (and parents)       |
//! | `rmdir`         | `temp_dir`         | remove the directory and its contents    |
//! | `fetch_weather` | `city`, `temp_dir` | save the forecast to `{temp_dir}/{city}_response.json` |

pub mod fs;
pub mod weather;

use std::sync::Arc;

use taskmill_core::config::{JobsConfig, TaskmillConfig};
use taskmill_scheduler::{Catalogue, Job, JobRef};

pub use weather::WeatherFetcher;

pub const MKDIR: &str = "mkdir";
pub const RMDIR: &str = "rmdir";
pub const FETCH_WEATHER: &str = "fetch_weather";

/// Register every known target.
pub fn catalogue(config: &TaskmillConfig) -> reqwest::Result<Catalogue> {
    let mut catalogue = Catalogue::new();
    catalogue.register(MKDIR, fs::mkdir());
    catalogue.register(RMDIR, fs::rmdir());
    catalogue.register(
        FETCH_WEATHER,
        Arc::new(WeatherFetcher::new(&config.weather)?),
    );
    Ok(catalogue)
}

/// Create the work dir, fetch every configured city into it, then remove it.
///
/// Returned in registration order; the last job depends on all others.
pub fn default_roster(
    config: &JobsConfig,
    catalogue: &Catalogue,
) -> taskmill_scheduler::Result<Vec<JobRef>> {
    let work_dir = config.work_dir.as_str();

    let mkdir = Job::builder("CREATE_TEMP_DIR", catalogue.resolve(MKDIR)?)
        .arg(work_dir)
        .build();

    let fetch = catalogue.resolve(FETCH_WEATHER)?;
    let fetches: Vec<JobRef> = config
        .cities
        .iter()
        .map(|city| {
            let mut builder = Job::builder(
                format!("WEATHER_{}_TO_JSON", city.to_uppercase()),
                fetch.clone(),
            )
            .args([city.as_str(), work_dir])
            .tries(config.tries)
            .retry_backoff(config.retry_backoff())
            .depends_on(&mkdir);
            if let Some(limit) = config.max_working_time() {
                builder = builder.max_working_time(limit);
            }
            builder.build()
        })
        .collect();

    let mut rmdir = Job::builder("DELETE_TEMP_DIR", catalogue.resolve(RMDIR)?)
        .arg(work_dir)
        .depends_on(&mkdir);
    for job in &fetches {
        rmdir = rmdir.depends_on(job);
    }

    let mut roster = Vec::with_capacity(fetches.len() + 2);
    roster.push(mkdir);
    roster.extend(fetches);
    roster.push(rmdir.build());
    Ok(roster)
}
