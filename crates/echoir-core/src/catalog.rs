//! Remote catalog access: playback manifests, track metadata and audio parts.
//!
//! The pipeline only sees the [`CatalogClient`] trait. [`HttpCatalogClient`]
//! is the shipped implementation; it owns the retry policy for transient
//! network failures so that pipeline stages never retry on their own.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, Error, FileSystemError, Result};
use crate::quality::{QualityProfile, extension_for_codec};

/// Default catalog endpoint (a local catalog proxy).
pub const DEFAULT_CATALOG_URL: &str = "http://127.0.0.1:8787";

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Loosely typed tag map as returned by the catalog (`TITLE`, `COVER`, ...).
pub type RawTags = BTreeMap<String, String>;

/// Where to fetch the audio for one track at one quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackManifest {
    /// Codec reported by the catalog (`flac`, `mp4a.40.2`, `eac3`, ...).
    pub codec: String,
    /// Ordered content part URLs. One entry for a single-file stream.
    pub parts: Vec<String>,
    /// Sample bit depth, when reported.
    pub bit_depth: Option<u32>,
    /// Sample rate in Hz, when reported.
    pub sample_rate: Option<u32>,
}

impl PlaybackManifest {
    /// Whether the stream is split into several parts.
    #[must_use]
    pub fn is_multi_part(&self) -> bool {
        self.parts.len() > 1
    }

    /// File extension for this stream.
    #[must_use]
    pub fn extension(&self, quality: QualityProfile) -> &'static str {
        extension_for_codec(&self.codec, quality)
    }
}

/// Access to the remote music catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the playback manifest for a track at a quality tier.
    async fn fetch_manifest(
        &self,
        track_id: &str,
        quality: QualityProfile,
    ) -> Result<PlaybackManifest>;

    /// Fetch the raw tag map for a track.
    async fn fetch_track_metadata(&self, track_id: &str) -> Result<RawTags>;

    /// Download a resource fully into memory.
    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Stream a resource into a file, returning the number of bytes written.
    async fn download_to_file(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// Configuration for the HTTP catalog client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
        }
    }
}

impl CatalogConfig {
    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, initial_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Manifest payload from the catalog API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestResponse {
    #[serde(default)]
    codec: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    bit_depth: Option<u32>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

impl From<ManifestResponse> for PlaybackManifest {
    fn from(resp: ManifestResponse) -> Self {
        Self {
            codec: resp.codec.unwrap_or_default(),
            parts: resp.urls,
            bit_depth: resp.bit_depth,
            sample_rate: resp.sample_rate,
        }
    }
}

/// [`CatalogClient`] over HTTP with retry and exponential backoff.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    config: CatalogConfig,
}

impl HttpCatalogClient {
    /// Build a client from configuration.
    pub fn new(config: CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("echoir/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &CatalogConfig {
        &self.config
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let base = self.config.base_url.trim_end_matches('/');
        Url::parse_with_params(&format!("{base}/{path}"), params).map_err(|e| {
            Error::Configuration(format!("Invalid catalog URL {base}: {e}"))
        })
    }

    fn parse_url(url: &str) -> Result<Url> {
        Url::parse(url).map_err(|e| {
            DownloadError::InvalidResponse {
                url: url.to_string(),
                reason: format!("invalid URL: {e}"),
            }
            .into()
        })
    }

    /// Send a GET, retrying timeouts, connection failures, 5xx and 429.
    async fn get_with_retry(&self, url: &Url) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let failure = match self.client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let err = DownloadError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                    };
                    if !is_retryable_status(status) {
                        return Err(err.into());
                    }
                    err
                }
                Err(e) => {
                    let err = DownloadError::Network {
                        url: url.to_string(),
                        reason: e.to_string(),
                    };
                    if !(e.is_timeout() || e.is_connect()) {
                        return Err(err.into());
                    }
                    err
                }
            };

            if attempt >= self.config.max_retries {
                return Err(failure.into());
            }
            let delay = self.config.backoff(attempt);
            warn!(
                url = %url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Catalog request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn stream_into(resp: &mut reqwest::Response, url: &Url, destination: &Path) -> Result<u64> {
        let write_failed = |e: std::io::Error| FileSystemError::WriteFailed {
            path: destination.to_path_buf(),
            reason: e.to_string(),
        };

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(write_failed)?;
        let mut written = 0_u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })? {
            file.write_all(&chunk).await.map_err(write_failed)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_failed)?;
        Ok(written)
    }
}

impl std::fmt::Debug for HttpCatalogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCatalogClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_manifest(
        &self,
        track_id: &str,
        quality: QualityProfile,
    ) -> Result<PlaybackManifest> {
        let mut params = vec![("id", track_id), ("quality", quality.api_selector())];
        if let Some(codec) = quality.spatial_codec() {
            params.push(("codec", codec.as_str()));
        }
        let url = self.endpoint("track/manifest", &params)?;
        debug!(track_id, %quality, "Fetching playback manifest");

        let resp = self.get_with_retry(&url).await.map_err(|e| match e {
            Error::Download(DownloadError::HttpStatus { .. }) => {
                Error::Download(DownloadError::ManifestUnavailable {
                    track_id: track_id.to_string(),
                    reason: e.to_string(),
                })
            }
            other => other,
        })?;
        let body: ManifestResponse =
            resp.json()
                .await
                .map_err(|e| DownloadError::InvalidResponse {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(body.into())
    }

    async fn fetch_track_metadata(&self, track_id: &str) -> Result<RawTags> {
        let url = self.endpoint("track/metadata", &[("id", track_id)])?;
        debug!(track_id, "Fetching track metadata");

        let resp = self.get_with_retry(&url).await?;
        let body: serde_json::Map<String, serde_json::Value> =
            resp.json()
                .await
                .map_err(|e| DownloadError::InvalidResponse {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(stringify_tags(body))
    }

    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = Self::parse_url(url)?;
        let resp = self.get_with_retry(&parsed).await?;
        let bytes = resp.bytes().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn download_to_file(&self, url: &str, destination: &Path) -> Result<u64> {
        let parsed = Self::parse_url(url)?;
        let mut resp = self.get_with_retry(&parsed).await?;

        match Self::stream_into(&mut resp, &parsed, destination).await {
            Ok(written) => {
                debug!(url, bytes = written, path = %destination.display(), "Downloaded part");
                Ok(written)
            }
            Err(e) => {
                // Never leave a truncated part behind.
                let _ = tokio::fs::remove_file(destination).await;
                Err(e)
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Flatten a JSON object into upper-cased string tags. Nulls and nested
/// objects are dropped; arrays of scalars are joined with `", "`.
fn stringify_tags(body: serde_json::Map<String, serde_json::Value>) -> RawTags {
    use serde_json::Value;

    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    body.into_iter()
        .filter_map(|(key, value)| {
            let text = match &value {
                Value::Array(items) => {
                    let parts: Vec<_> = items.iter().filter_map(scalar).collect();
                    (!parts.is_empty()).then(|| parts.join(", "))
                }
                other => scalar(other),
            }?;
            Some((key.to_ascii_uppercase(), text))
        })
        .collect()
}
