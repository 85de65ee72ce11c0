use std::sync::Mutex;
use std::time::Duration;

use clap::{Parser, Subcommand};
use taskmill_core::config::LoggingConfig;
use taskmill_core::TaskmillConfig;
use taskmill_scheduler::{RunSummary, Scheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskmill", version, about = "Dependency-aware job scheduler")]
struct Cli {
    /// TOML config file; a missing file means defaults.
    #[arg(long, env = "TASKMILL_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the default roster and run it.
    Run {
        /// Stop gracefully after this many seconds and save the rest.
        #[arg(long)]
        stop_after: Option<f64>,
    },
    /// Resume the roster saved by the last graceful stop.
    Restart {
        /// Stop gracefully after this many seconds and save the rest.
        #[arg(long)]
        stop_after: Option<f64>,
    },
    /// List the job targets snapshots may refer to.
    Targets,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // config first: it carries the log filter and file
    let (config, config_error) = match TaskmillConfig::load(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (TaskmillConfig::default(), Some(e)),
    };
    init_tracing(&config.logging)?;
    if let Some(e) = config_error {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
    }

    let catalogue = taskmill_jobs::catalogue(&config)?;

    match cli.command {
        Command::Targets => {
            for name in catalogue.names() {
                println!("{name}");
            }
        }
        Command::Run { stop_after } => {
            let roster = taskmill_jobs::default_roster(&config.jobs, &catalogue)?;
            let mut scheduler = Scheduler::new(&config.scheduler, catalogue);
            for job in &roster {
                scheduler.add_to_schedule(job);
            }
            stop_on_ctrl_c(&scheduler);
            let stop_after = resolve_stop_after(stop_after, &config);
            let summary = scheduler.run(stop_after).await?;
            report(&summary, &scheduler);
        }
        Command::Restart { stop_after } => {
            let mut scheduler = Scheduler::new(&config.scheduler, catalogue);
            stop_on_ctrl_c(&scheduler);
            let stop_after = resolve_stop_after(stop_after, &config);
            let summary = scheduler.restart(stop_after).await?;
            report(&summary, &scheduler);
        }
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| logging.filter.as_str().into());
    match logging.open_file()? {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

/// `--stop-after` wins over `scheduler.stop_after_secs`; non-positive means none.
fn resolve_stop_after(flag: Option<f64>, config: &TaskmillConfig) -> Option<Duration> {
    match flag {
        Some(secs) => Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero()),
        None => config.scheduler.stop_after(),
    }
}

/// First Ctrl-C stops the loop gracefully; the roster is saved once in-flight
/// jobs settle.
fn stop_on_ctrl_c(scheduler: &Scheduler) {
    let handle = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after in-flight jobs");
            handle.request_stop();
        }
    });
}

fn report(summary: &RunSummary, scheduler: &Scheduler) {
    if summary.stopped {
        info!(
            path = %scheduler.snapshot_path().display(),
            remaining = summary.remaining,
            "unfinished jobs saved, resume with `taskmill restart`"
        );
    }
    println!(
        "done: {}, failed: {}, canceled: {}, remaining: {}, elapsed: {:.3}s",
        summary.done,
        summary.failed,
        summary.canceled,
        summary.remaining,
        summary.elapsed.as_secs_f64()
    );
}
