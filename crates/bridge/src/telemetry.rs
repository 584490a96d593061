//! Time-series channel client (ThingSpeak). Writes one flat record per upload
//! cycle and reads back the channel feed for daily reports.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::state::UploadBatch;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Submit one batch. `Ok` means the channel accepted the entry.
    async fn submit(&self, batch: &UploadBatch) -> Result<()>;

    /// Historical entries, oldest first.
    async fn feed(&self) -> Result<Vec<FeedEntry>>;
}

/// One historical submission as returned by the read API.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub created_at: OffsetDateTime,
    pub temperature: Option<i64>,
    pub illumination: Option<i64>,
    pub detections: Option<i64>,
    pub secure_mode_secs: Option<i64>,
    pub auto_light_secs: Option<i64>,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChannelFeed {
    feeds: Vec<RawFeed>,
}

#[derive(Debug, Deserialize)]
struct RawFeed {
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    field1: Option<String>,
    field2: Option<String>,
    field3: Option<String>,
    field4: Option<String>,
    field5: Option<String>,
}

/// Parse a `feeds.json` body. Missing or non-numeric fields become `None`.
pub(crate) fn parse_feed(body: &str) -> Result<Vec<FeedEntry>> {
    let channel: ChannelFeed = serde_json::from_str(body).context("bad feed json")?;
    Ok(channel
        .feeds
        .into_iter()
        .map(|f| FeedEntry {
            created_at: f.created_at,
            temperature: field_value(f.field1.as_deref()),
            illumination: field_value(f.field2.as_deref()),
            detections: field_value(f.field3.as_deref()),
            secure_mode_secs: field_value(f.field4.as_deref()),
            auto_light_secs: field_value(f.field5.as_deref()),
        })
        .collect())
}

fn field_value(raw: Option<&str>) -> Option<i64> {
    let s = raw?.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|v| v.round() as i64))
}

/// Query parameters for one update.
pub(crate) fn update_fields(batch: &UploadBatch) -> [(&'static str, String); 5] {
    [
        ("field1", batch.temperature.to_string()),
        ("field2", batch.illumination.to_string()),
        ("field3", batch.detections.to_string()),
        ("field4", batch.secure_mode_secs.to_string()),
        ("field5", batch.auto_light_secs.to_string()),
    ]
}

// ---------------------------------------------------------------------------
// ThingSpeak client
// ---------------------------------------------------------------------------

pub struct ThingSpeak {
    http: reqwest::Client,
    base_url: String,
    channel_id: String,
    write_key: String,
    read_key: String,
    results: u32,
}

impl ThingSpeak {
    pub fn new(cfg: &TelemetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            channel_id: cfg.channel_id.clone(),
            write_key: cfg.write_key.clone(),
            read_key: cfg.read_key.clone(),
            results: cfg.feed_results,
        })
    }
}

#[async_trait]
impl TelemetrySink for ThingSpeak {
    async fn submit(&self, batch: &UploadBatch) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/update", self.base_url))
            .query(&[("api_key", self.write_key.as_str())])
            .query(&update_fields(batch))
            .send()
            .await
            .context("telemetry update request failed")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("telemetry update rejected: http {status}");
        }
        // The channel answers "0" when it refuses an entry (e.g. rate limit).
        if body.trim() == "0" {
            bail!("telemetry update refused by channel");
        }

        debug!(entry = %body.trim(), "telemetry entry stored");
        Ok(())
    }

    async fn feed(&self) -> Result<Vec<FeedEntry>> {
        let resp = self
            .http
            .get(format!(
                "{}/channels/{}/feeds.json",
                self.base_url, self.channel_id
            ))
            .query(&[("api_key", self.read_key.as_str())])
            .query(&[("results", self.results)])
            .send()
            .await
            .context("telemetry feed request failed")?
            .error_for_status()
            .context("telemetry feed rejected")?;

        let body = resp.text().await.context("failed to read feed body")?;
        parse_feed(&body)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
