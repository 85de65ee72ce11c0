use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use taskmill_core::config::{WeatherConfig, DEFAULT_WORK_DIR};
use taskmill_scheduler::{JobBody, JobContext};
use tracing::{debug, info, warn};

/// Downloads one city's forecast and saves it as pretty-printed JSON.
///
/// Arguments: `city` (0) and `temp_dir` (1, defaults to `results`).
pub struct WeatherFetcher {
    client: reqwest::Client,
    url_template: String,
    urls: BTreeMap<String, String>,
}

impl WeatherFetcher {
    pub fn new(config: &WeatherConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url_template: config.url_template.clone(),
            urls: config.urls.clone(),
        })
    }

    /// Per-city override first, then the template with `{city}` filled in.
    pub fn url_for(&self, city: &str) -> String {
        self.urls
            .get(city)
            .cloned()
            .unwrap_or_else(|| self.url_template.replace("{city}", city))
    }

    pub async fn fetch(&self, city: &str) -> anyhow::Result<Value> {
        let url = self.url_for(city);
        debug!(%city, %url, "requesting forecast");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%city, status = status.as_u16(), body = %text, "forecast API error");
            bail!("{url} returned {status}");
        }

        resp.json()
            .await
            .with_context(|| format!("{url} returned invalid JSON"))
    }
}

#[async_trait]
impl JobBody for WeatherFetcher {
    async fn call(&self, ctx: JobContext) -> anyhow::Result<()> {
        let city = ctx.str_param(0, "city")?;
        let dir = match ctx.param(1, "temp_dir") {
            Some(value) => value
                .as_str()
                .with_context(|| format!("argument `temp_dir` must be a string, got {value}"))?,
            None => DEFAULT_WORK_DIR,
        };
        info!(job = %ctx.job_name, %city, attempt = ctx.attempt, "fetching forecast");

        let forecast = tokio::select! {
            res = self.fetch(city) => res?,
            _ = ctx.cancel.cancelled() => bail!("forecast for {city} canceled"),
        };

        let path = Path::new(dir).join(format!("{city}_response.json"));
        let body = serde_json::to_vec_pretty(&forecast)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(job = %ctx.job_name, %city, path = %path.display(), "forecast saved");
        Ok(())
    }
}
