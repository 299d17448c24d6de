//! Client for the external telemetry source.
//!
//! The source is pull-only: one GET returns the whole fleet as
//! `{"result_list": [...]}`. Entries are left as raw JSON so the ingestor can
//! validate them one at a time.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracksync_types::Snapshot;

/// Errors fetching a snapshot. Any of these aborts a single ingestion pass.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The request could not be sent or timed out.
    #[error("Telemetry source not reachable at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The source answered with a non-success status.
    #[error("Telemetry source returned HTTP {status}")]
    Status { status: u16 },

    /// The body was not a snapshot envelope.
    #[error("Failed to decode telemetry snapshot: {0}")]
    Decode(String),
}

/// Something that can produce a full fleet snapshot.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Snapshot, TelemetryError>;
}

/// HTTP telemetry source.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    /// Create a source for `url` with a per-request deadline.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TelemetryError> {
        let url = url.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Request {
                url: url.clone(),
                source: e,
            })?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TelemetrySource for HttpSource {
    async fn fetch_snapshot(&self) -> Result<Snapshot, TelemetryError> {
        let response =
            self.client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| TelemetryError::Request {
                    url: self.url.clone(),
                    source: e,
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| TelemetryError::Request {
            url: self.url.clone(),
            source: e,
        })?;

        serde_json::from_slice(body.trim_ascii()).map_err(|e| TelemetryError::Decode(e.to_string()))
    }
}
