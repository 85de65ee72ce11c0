use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Map, Value};
use taskmill_core::config::{JobsConfig, SchedulerConfig, TaskmillConfig, WeatherConfig};
use taskmill_jobs::{catalogue, default_roster, WeatherFetcher};
use taskmill_scheduler::{JobBody, JobContext, JobId, JobStatus, Scheduler};
use tokio_util::sync::CancellationToken;

async fn forecast(Path(city): Path<String>) -> Result<Json<Value>, StatusCode> {
    match city.as_str() {
        "ATLANTIS" => Err(StatusCode::NOT_FOUND),
        "SLOW" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Json(json!({ "city": city })))
        }
        _ => Ok(Json(json!({ "city": city, "forecasts": [{ "temp": 21 }] }))),
    }
}

/// Forecast stub on an ephemeral port.
async fn serve() -> SocketAddr {
    let app = Router::new().route("/{city}", get(forecast));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn weather_config(addr: SocketAddr) -> WeatherConfig {
    WeatherConfig {
        url_template: format!("http://{addr}/{{city}}"),
        request_timeout_secs: 2,
        ..Default::default()
    }
}

fn ctx(args: &[&str], cancel: CancellationToken) -> JobContext {
    JobContext {
        job_id: JobId::new(),
        job_name: "fetch".to_string(),
        args: Arc::new(args.iter().map(|a| Value::from(*a)).collect()),
        kwargs: Arc::new(Map::new()),
        attempt: 1,
        cancel,
    }
}

#[tokio::test]
async fn fetch_saves_response_file() {
    let addr = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let fetcher = WeatherFetcher::new(&weather_config(addr)).unwrap();
    let dir_arg = dir.path().to_string_lossy().into_owned();

    fetcher
        .call(ctx(&["MOSCOW", &dir_arg], CancellationToken::new()))
        .await
        .expect("fetch");

    let saved: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("MOSCOW_response.json")).unwrap())
            .unwrap();
    assert_eq!(saved["city"], "MOSCOW");
    assert_eq!(saved["forecasts"][0]["temp"], 21);
}

#[tokio::test]
async fn http_error_fails_the_attempt() {
    let addr = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let fetcher = WeatherFetcher::new(&weather_config(addr)).unwrap();
    let dir_arg = dir.path().to_string_lossy().into_owned();

    let err = fetcher
        .call(ctx(&["ATLANTIS", &dir_arg], CancellationToken::new()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"));
    assert!(!dir.path().join("ATLANTIS_response.json").exists());
}

#[tokio::test]
async fn cancellation_abandons_request() {
    let addr = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let fetcher = WeatherFetcher::new(&weather_config(addr)).unwrap();
    let dir_arg = dir.path().to_string_lossy().into_owned();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = fetcher
        .call(ctx(&["SLOW", &dir_arg], cancel))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("canceled"));
}

#[tokio::test]
async fn default_roster_runs_to_completion() {
    let addr = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let work_dir = dir.path().join("results");
    let config = TaskmillConfig {
        scheduler: SchedulerConfig {
            pool_size: 2,
            stop_after_secs: None,
            snapshot_path: dir.path().join("schedule.json").to_string_lossy().into_owned(),
        },
        jobs: JobsConfig {
            work_dir: work_dir.to_string_lossy().into_owned(),
            cities: vec!["MOSCOW".to_string(), "ATLANTIS".to_string()],
            tries: 1,
            ..Default::default()
        },
        weather: weather_config(addr),
        ..Default::default()
    };
    let catalogue = catalogue(&config).expect("catalogue");
    let roster = default_roster(&config.jobs, &catalogue).expect("roster");
    let mut scheduler = Scheduler::new(&config.scheduler, catalogue);
    for job in &roster {
        scheduler.add_to_schedule(job);
    }

    let summary = scheduler.run(None).await.expect("run");

    let statuses: Vec<(String, JobStatus)> = roster
        .iter()
        .map(|j| (j.name().to_string(), j.status()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("CREATE_TEMP_DIR".to_string(), JobStatus::Done),
            ("WEATHER_MOSCOW_TO_JSON".to_string(), JobStatus::Done),
            ("WEATHER_ATLANTIS_TO_JSON".to_string(), JobStatus::Error),
            ("DELETE_TEMP_DIR".to_string(), JobStatus::Canceled),
        ]
    );
    // the failed fetch used its single retry
    assert_eq!(roster[2].tries(), 0);
    assert_eq!(summary.remaining, 0);
    // cleanup never ran, so the saved forecast is still there
    assert!(work_dir.join("MOSCOW_response.json").exists());
}
