use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskmill_core::config::SchedulerConfig;
use taskmill_scheduler::{body_fn, Catalogue, Job, JobContext, JobStatus, Scheduler};

type Events = Arc<Mutex<Vec<String>>>;

/// Catalogue whose bodies only record when they start and finish.
fn recording_catalogue(events: &Events) -> Catalogue {
    let mut catalogue = Catalogue::new();
    for name in ["mkdir", "fetch", "rmdir"] {
        let events = Arc::clone(events);
        catalogue.register(
            name,
            body_fn(move |ctx: JobContext| {
                let events = Arc::clone(&events);
                async move {
                    events.lock().unwrap().push(format!("start {}", ctx.job_name));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    events.lock().unwrap().push(format!("end {}", ctx.job_name));
                    Ok(())
                }
            }),
        );
    }
    catalogue
}

fn position(events: &[String], entry: &str) -> usize {
    events
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("missing event `{entry}` in {events:?}"))
}

#[tokio::test]
async fn fetches_run_between_mkdir_and_rmdir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let catalogue = recording_catalogue(&events);
    let config = SchedulerConfig {
        pool_size: 2,
        stop_after_secs: None,
        snapshot_path: dir.path().join("schedule.json").to_string_lossy().into_owned(),
    };
    let mut scheduler = Scheduler::new(&config, catalogue.clone());

    let mkdir = Job::builder("mkdir(out)", catalogue.resolve("mkdir").unwrap())
        .arg("out")
        .build();
    let fetch_a = Job::builder("fetch(A)", catalogue.resolve("fetch").unwrap())
        .args(["A", "out"])
        .depends_on(&mkdir)
        .build();
    let fetch_b = Job::builder("fetch(B)", catalogue.resolve("fetch").unwrap())
        .args(["B", "out"])
        .depends_on(&mkdir)
        .build();
    let rmdir = Job::builder("rmdir(out)", catalogue.resolve("rmdir").unwrap())
        .arg("out")
        .depends_on(&mkdir)
        .depends_on(&fetch_a)
        .depends_on(&fetch_b)
        .build();

    // registering only the last job pulls in the whole graph
    scheduler.add_to_schedule(&rmdir);
    assert_eq!(scheduler.roster().len(), 4);

    let summary = scheduler.run(None).await.expect("run");

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0], "start mkdir(out)");
    let rmdir_start = position(&events, "start rmdir(out)");
    assert!(position(&events, "end fetch(A)") < rmdir_start);
    assert!(position(&events, "end fetch(B)") < rmdir_start);
    assert!(position(&events, "end mkdir(out)") < position(&events, "start fetch(A)"));

    assert!(scheduler.roster().is_empty());
    for job in [&mkdir, &fetch_a, &fetch_b, &rmdir] {
        assert!(job.status().is_terminal());
        assert_eq!(job.status(), JobStatus::Done);
    }
    assert_eq!(summary.done, 4);
    assert!(!summary.stopped);
    // a run that drains the roster leaves no snapshot behind
    assert!(!dir.path().join("schedule.json").exists());
}

#[tokio::test]
async fn stopped_graph_resumes_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let catalogue = recording_catalogue(&events);
    let config = SchedulerConfig {
        pool_size: 1,
        stop_after_secs: None,
        snapshot_path: dir.path().join("state/schedule.json").to_string_lossy().into_owned(),
    };

    let mut first = Scheduler::new(&config, catalogue.clone());
    let mkdir = Job::builder("mkdir", catalogue.resolve("mkdir").unwrap()).build();
    let fetch = Job::builder("fetch", catalogue.resolve("fetch").unwrap())
        .depends_on(&mkdir)
        .build();
    let rmdir = Job::builder("rmdir", catalogue.resolve("rmdir").unwrap())
        .depends_on(&fetch)
        .build();
    first.add_to_schedule(&rmdir);

    let stopped = first.run(Some(Duration::from_millis(5))).await.expect("first run");
    assert!(stopped.stopped);
    assert!(stopped.remaining > 0);

    let mut second = Scheduler::new(&config, catalogue);
    let resumed = second.restart(None).await.expect("restart");

    assert!(!resumed.stopped);
    assert!(second.roster().is_empty());
    let events = events.lock().unwrap().clone();
    let last_rmdir = events.iter().rposition(|e| e == "start rmdir").expect("rmdir ran");
    let last_fetch_end = events.iter().rposition(|e| e == "end fetch").expect("fetch ran");
    assert!(last_fetch_end < last_rmdir);
}
