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

//! Threshold-based health aggregation (spec.md §4.5) and its HTTP surface
//! (spec.md §6).

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// All the errors that can occur while running the health HTTP server.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configured bind address could not be parsed.
    #[error("invalid health bind address {address}: {source}")]
    InvalidBindAddress {
        /// The address that failed to parse.
        address: String,
        /// The parse error.
        source: std::net::AddrParseError,
    },
    /// The TCP listener could not be bound.
    #[error("failed to bind health server on {address}: {source}")]
    BindFailed {
        /// The address the bind was attempted on.
        address: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// The server loop exited with an error.
    #[error("health server error: {0}")]
    ServeFailed(#[source] std::io::Error),
}

/// The status of one component, or of the agent overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Operating normally.
    Ok,
    /// Operating with reduced confidence; no action required yet.
    Degraded,
    /// Failing; operator attention warranted.
    Error,
}

/// The category a component belongs to, used by the overall aggregation
/// rule (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentKind {
    /// A metric collector.
    Collector,
    /// The HTTP uploader.
    Uploader,
    /// The queue store.
    Storage,
    /// The clock-skew probe.
    Clock,
}

/// One component's current status report.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    /// The component's category.
    #[serde(skip)]
    pub kind: ComponentKind,
    /// The component's current status.
    pub status: Status,
    /// A human-readable message, usually echoing the last error.
    pub message: String,
    /// When this report was last updated.
    pub last_update: DateTime<Utc>,
    /// Free-form details, e.g. `pending`, `wal_size_bytes`.
    pub details: BTreeMap<String, String>,
}

/// The thresholds that drive the uploader and storage rules, derived from
/// the configured upload period (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Above this time-since-last-success, the uploader is at least Degraded.
    pub ok_upload: Duration,
    /// Above this time-since-last-success, the uploader is at least Error
    /// (combined with the pending-degraded limit).
    pub degraded_upload: Duration,
    /// Constant error threshold: 10 minutes regardless of upload period.
    pub error_upload: Duration,
    /// Pending count above which the uploader is at least Degraded.
    pub pending_ok_limit: u64,
    /// Pending count above which the uploader is at least Error (combined
    /// with the error-upload threshold).
    pub pending_degraded_limit: u64,
    /// Absolute clock skew, in milliseconds, above which the clock
    /// component is Degraded.
    pub clock_skew_warn_ms: i64,
}

impl Thresholds {
    /// Derives thresholds from the configured upload period `p` (spec.md
    /// §4.5): `ok_upload_secs = max(2p, 1)`, `degraded_upload_secs =
    /// max(10p, 1)`, `error_upload_secs = 600` (constant).
    pub fn from_upload_period(p: Duration, clock_skew_warn_ms: i64) -> Self {
        let p = p.as_secs_f64();
        Self {
            ok_upload: Duration::from_secs_f64((2.0 * p).max(1.0)),
            degraded_upload: Duration::from_secs_f64((10.0 * p).max(1.0)),
            error_upload: Duration::from_secs(600),
            pending_ok_limit: 5000,
            pending_degraded_limit: 10000,
            clock_skew_warn_ms,
        }
    }
}

/// Evaluates a collector's component status: OK if its last collection
/// succeeded, Error (echoing the message) otherwise.
pub fn evaluate_collector(last_error: Option<&str>) -> (Status, String) {
    match last_error {
        None => (Status::Ok, "collecting normally".to_string()),
        Some(err) => (Status::Error, err.to_string()),
    }
}

/// Evaluates the uploader's component status (spec.md §4.5). `last_success_age`
/// is `None` when no upload has ever succeeded, treated as an unbounded age.
pub fn evaluate_uploader(
    last_success_age: Option<Duration>,
    last_error: Option<&str>,
    pending: u64,
    thresholds: &Thresholds,
) -> (Status, String) {
    if let Some(err) = last_error {
        return (Status::Error, err.to_string());
    }

    let age = last_success_age.unwrap_or(Duration::MAX);

    if age > thresholds.error_upload && pending > thresholds.pending_degraded_limit {
        return (
            Status::Error,
            format!("no successful upload in {:?}, {pending} samples pending", age),
        );
    }

    if pending > thresholds.pending_ok_limit || age > thresholds.ok_upload {
        return (Status::Degraded, format!("{pending} samples pending, last success {:?} ago", age));
    }

    (Status::Ok, "uploading normally".to_string())
}

/// Evaluates the storage component's status (spec.md §4.5). An I/O probe
/// failure always takes precedence over the WAL-size threshold.
pub fn evaluate_storage(wal_size_bytes: u64, io_probe_failed: bool) -> (Status, String) {
    const WAL_DEGRADED_BYTES: u64 = 64 * 1024 * 1024;

    if io_probe_failed {
        return (Status::Error, "storage I/O probe failed".to_string());
    }
    if wal_size_bytes > WAL_DEGRADED_BYTES {
        return (Status::Degraded, format!("WAL size {wal_size_bytes} bytes exceeds 64 MiB"));
    }
    (Status::Ok, "storage healthy".to_string())
}

/// Evaluates the clock-skew component's status (spec.md §4.5).
pub fn evaluate_clock(skew_ms: Option<i64>, probe_failed: bool, thresholds: &Thresholds) -> (Status, String) {
    if probe_failed {
        return (Status::Error, "clock-skew probe failed".to_string());
    }
    match skew_ms {
        Some(skew) if skew.abs() > thresholds.clock_skew_warn_ms => {
            (Status::Degraded, format!("clock skew {skew} ms exceeds threshold"))
        }
        _ => (Status::Ok, "clock in sync".to_string()),
    }
}

/// Shared, thread-safe health registry. Tasks call [`HealthRegistry::update`]
/// whenever a component's status changes; the HTTP surface reads a
/// consistent snapshot.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Mutex<BTreeMap<String, ComponentReport>>>,
    started_at: Instant,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Creates an empty registry, timestamped at construction.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            started_at: Instant::now(),
        }
    }

    /// Records a component's current status.
    pub fn update(&self, name: impl Into<String>, kind: ComponentKind, status: Status, message: impl Into<String>, details: BTreeMap<String, String>) {
        let name = name.into();
        let report = ComponentReport {
            kind,
            status,
            message: message.into(),
            last_update: Utc::now(),
            details,
        };
        let _ = self.inner.lock().expect("health registry mutex poisoned").insert(name, report);
    }

    /// Returns a snapshot of all component reports.
    pub fn snapshot(&self) -> BTreeMap<String, ComponentReport> {
        self.inner.lock().expect("health registry mutex poisoned").clone()
    }

    /// Computes the overall status from the aggregation rule in spec.md
    /// §4.5: OK if all components are OK; Error if all collectors are in
    /// Error, or the uploader is in Error, or storage is in Error;
    /// otherwise Degraded.
    pub fn overall(&self) -> Status {
        let components = self.inner.lock().expect("health registry mutex poisoned");
        if components.is_empty() {
            return Status::Ok;
        }
        if components.values().all(|c| c.status == Status::Ok) {
            return Status::Ok;
        }

        let mut collectors = components.values().filter(|c| c.kind == ComponentKind::Collector).peekable();
        let all_collectors_error = collectors.peek().is_some() && collectors.all(|c| c.status == Status::Error);
        let uploader_error = components
            .values()
            .any(|c| c.kind == ComponentKind::Uploader && c.status == Status::Error);
        let storage_error = components
            .values()
            .any(|c| c.kind == ComponentKind::Storage && c.status == Status::Error);

        if all_collectors_error || uploader_error || storage_error {
            Status::Error
        } else {
            Status::Degraded
        }
    }

    fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: Status,
    timestamp: DateTime<Utc>,
    uptime_seconds: f64,
    components: BTreeMap<String, ComponentReport>,
}

/// Builds the `/health`, `/health/live`, `/health/ready` router (spec.md
/// §6).
pub fn router(registry: HealthRegistry) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/health/live", get(get_live))
        .route("/health/ready", get(get_ready))
        .with_state(registry)
}

async fn get_health(State(registry): State<HealthRegistry>) -> (StatusCode, Json<HealthResponse>) {
    let overall = registry.overall();
    let body = HealthResponse {
        status: overall,
        timestamp: Utc::now(),
        uptime_seconds: registry.uptime_seconds(),
        components: registry.snapshot(),
    };
    let code = if overall == Status::Error { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(body))
}

async fn get_live() -> StatusCode {
    StatusCode::OK
}

async fn get_ready(State(registry): State<HealthRegistry>) -> StatusCode {
    if registry.overall() == Status::Ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Expands a Go-style `:port` address (spec.md §6's `monitoring.health_address`
/// default, `:9100`) into an explicit all-interfaces bind address, since
/// `SocketAddr`'s parser has no notion of a bare port. Addresses that already
/// carry a host are passed through unchanged.
fn expand_bind_address(bind_address: &str) -> std::borrow::Cow<'_, str> {
    if bind_address.starts_with(':') {
        std::borrow::Cow::Owned(format!("0.0.0.0{bind_address}"))
    } else {
        std::borrow::Cow::Borrowed(bind_address)
    }
}

/// Binds and serves the health HTTP surface until `cancel` fires.
pub async fn serve(bind_address: &str, registry: HealthRegistry, cancel: CancellationToken) -> Result<(), Error> {
    let expanded = expand_bind_address(bind_address);
    let addr: std::net::SocketAddr = expanded.parse().map_err(|source| Error::InvalidBindAddress {
        address: bind_address.to_string(),
        source,
    })?;

    let listener = TcpListener::bind(addr).await.map_err(|source| Error::BindFailed {
        address: addr.to_string(),
        source,
    })?;

    tracing::info!(%addr, "health server listening");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(Error::ServeFailed)
}
