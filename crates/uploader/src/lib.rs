#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The chunked HTTP uploader (spec.md §4.4): transport, status
//! classification, and retry with decorrelated jitter.

use std::time::Duration;

use chunking::Chunk;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{header::HeaderMap, Client, StatusCode};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// All the errors that can occur while uploading.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The uploader's HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Configuration for one uploader instance (spec.md §6 `remote.*`).
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Ingest endpoint URL.
    pub url: String,
    /// Device identifier sent as `X-Device-ID`.
    pub device_id: String,
    /// Optional bearer token sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// `User-Agent` header value, e.g. `telemetry-agent/0.1.0`.
    pub user_agent: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Maximum number of retries per chunk (0 means a single attempt, no retries).
    pub max_retries: u32,
    /// Initial backoff delay, applied to attempt 1.
    pub initial_delay: Duration,
    /// Backoff multiplier applied between successive attempts (must be >= 1.0).
    pub backoff_multiplier: f64,
    /// Upper bound on the computed backoff delay, before jitter.
    pub max_delay: Duration,
    /// Symmetric multiplicative jitter, as a percentage of the base delay.
    pub jitter_percent: f64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            device_id: String::new(),
            auth_token: None,
            user_agent: format!("telemetry-agent/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_percent: 20.0,
        }
    }
}

/// The outcome of uploading a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// A 2xx response was received; the caller should mark these row ids
    /// uploaded.
    Uploaded,
    /// The chunk was rejected by the server in a way retries cannot fix
    /// (400, 401), or the retry budget was exhausted.
    Failed {
        /// The HTTP status of the final attempt, if any response was
        /// received at all.
        last_status: Option<u16>,
    },
    /// Cancellation fired before the chunk could be delivered.
    Cancelled,
}

enum AttemptOutcome {
    Success,
    NonRetryable(u16),
    Retryable { status: Option<u16>, retry_after: Option<Duration> },
}

/// Classifies an HTTP status code per spec.md §4.4.
fn classify(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        return AttemptOutcome::Success;
    }
    match status.as_u16() {
        400 | 401 => AttemptOutcome::NonRetryable(status.as_u16()),
        // 429, 5xx, and any other 4xx are retryable: the source behavior for
        // ambiguous 4xx codes is unspecified, and spec.md §9 resolves the open
        // question toward retrying rather than risking data loss.
        other => AttemptOutcome::Retryable {
            status: Some(other),
            retry_after: None,
        },
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = value.trim().parse::<u64>() {
        return if secs > 0 { Some(Duration::from_secs(secs)) } else { None };
    }

    let target = httpdate::parse_http_date(value.trim()).ok()?;
    target.duration_since(std::time::SystemTime::now()).ok().filter(|d| !d.is_zero())
}

/// Uploads compressed chunks to the remote ingest endpoint, retrying
/// transient failures with exponential backoff and decorrelated jitter.
pub struct Uploader {
    client: Client,
    config: UploaderConfig,
    rng: Mutex<StdRng>,
}

impl Uploader {
    /// Builds a new uploader. The jitter source is seeded once here, at
    /// construction, so that multiple device instances do not retry in
    /// lock-step (spec.md §4.4).
    pub fn new(config: UploaderConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::ClientBuild)?;

        Ok(Self {
            client,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Uploads a single chunk, retrying per the configured schedule.
    /// `chunk_index` and `metric_count` are sent as debug headers only.
    pub async fn upload_chunk(&self, chunk: &Chunk, chunk_index: usize, cancel: &CancellationToken) -> ChunkOutcome {
        let mut retry_after_hint: Option<Duration> = None;
        let mut last_status: Option<u16> = None;

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return ChunkOutcome::Cancelled;
            }

            if attempt > 0 {
                let delay = self.next_delay(attempt, retry_after_hint.take()).await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
                }
            }

            let send = tokio::select! {
                result = self.send_once(chunk, chunk_index, attempt) => result,
                _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
            };

            match send {
                Ok(AttemptOutcome::Success) => return ChunkOutcome::Uploaded,
                Ok(AttemptOutcome::NonRetryable(status)) => {
                    return ChunkOutcome::Failed { last_status: Some(status) };
                }
                Ok(AttemptOutcome::Retryable { status, retry_after }) => {
                    last_status = status;
                    retry_after_hint = retry_after;
                    tracing::warn!(attempt, status = ?status, "chunk upload attempt failed, will retry");
                }
                Err(()) => {
                    tracing::warn!(attempt, "transport error, will retry");
                }
            }
        }

        ChunkOutcome::Failed { last_status }
    }

    async fn send_once(&self, chunk: &Chunk, chunk_index: usize, attempt: u32) -> Result<AttemptOutcome, ()> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .header(reqwest::header::USER_AGENT, &self.config.user_agent)
            .header("X-Device-ID", &self.config.device_id)
            .header("X-Chunk-Index", chunk_index.to_string())
            .header("X-Chunk-Metrics", chunk.metric_count.to_string())
            .header("X-Attempt", attempt.to_string())
            .body(chunk.compressed.clone());

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            tracing::debug!(error = %err, "chunk upload transport error");
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(AttemptOutcome::Success);
        }

        let retry_after = parse_retry_after(response.headers());
        match classify(status) {
            AttemptOutcome::NonRetryable(code) => Ok(AttemptOutcome::NonRetryable(code)),
            _ => Ok(AttemptOutcome::Retryable {
                status: Some(status.as_u16()),
                retry_after,
            }),
        }
    }

    /// Computes the delay before `attempt` (attempt >= 1): honors a server
    /// `Retry-After` hint if present, else exponential backoff capped at
    /// `max_delay`, then applies symmetric multiplicative jitter.
    async fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = match retry_after {
            Some(d) if !d.is_zero() => d,
            _ => {
                let scaled = self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()))
            }
        };

        let jitter_fraction = self.config.jitter_percent / 100.0;
        let mut rng = self.rng.lock().await;
        let factor = rng.gen_range((1.0 - jitter_fraction)..=(1.0 + jitter_fraction));
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }
}
