//! The per-duty task loops the supervisor spawns: one per collector, the
//! uploader, the WAL checkpoint poller, and the clock-skew probe. Each is
//! built on a [`signal::Ticker`] and reports into the shared
//! [`health::HealthRegistry`] (spec.md §4.7, §5, §7).

use std::{collections::BTreeMap, time::Instant};

use collectors::Collector;
use config::{MonitoringConfig, RemoteConfig, StorageConfig};
use health::{ComponentKind, HealthRegistry, Status, Thresholds};
use sample::{Sample, ValueKind};
use signal::{CancellationToken, Tick, Ticker};
use store::{CheckpointPolicy, CheckpointState, QueueStore};
use uploader::{ChunkOutcome, Uploader, UploaderConfig};

/// How often the self-telemetry poller samples the agent's own queue
/// depth and store size. Not independently configurable (spec.md §4.7
/// names the task but not a dedicated interval key).
const SELF_TELEMETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

use crate::Error;

/// Runs `collector` on `interval` until cancelled. A collection failure is
/// logged and reflected in health, but never stops the task (spec.md §7).
pub async fn collector_task(
    name: String,
    mut collector: Box<dyn Collector>,
    interval: std::time::Duration,
    store: QueueStore,
    health: HealthRegistry,
    cancel: CancellationToken,
) {
    let component = format!("collector.{name}");
    let mut ticker = Ticker::new(interval, cancel.clone());

    loop {
        match ticker.tick().await {
            Tick::Cancelled => return,
            Tick::Elapsed => match collector.collect(&cancel).await {
                Ok(samples) if samples.is_empty() => {}
                Ok(samples) => match store.store_batch(samples).await {
                    Ok(_) => health.update(&component, ComponentKind::Collector, Status::Ok, "collecting normally", BTreeMap::new()),
                    Err(err) => {
                        tracing::error!(collector = %name, error = %err, "failed to store collected samples");
                        health.update(&component, ComponentKind::Collector, Status::Error, err.to_string(), BTreeMap::new());
                    }
                },
                Err(err) => {
                    tracing::warn!(collector = %name, error = %err, "collection cycle failed");
                    health.update(&component, ComponentKind::Collector, Status::Error, err.to_string(), BTreeMap::new());
                }
            },
        }
    }
}

/// Runs the WAL checkpoint poller: checks the age/size thresholds on its
/// own tick, independent of `wal_checkpoint_interval`, so a size spike is
/// noticed sooner than a full age period.
pub async fn checkpoint_task(store: QueueStore, storage: StorageConfig, health: HealthRegistry, cancel: CancellationToken) {
    let policy = CheckpointPolicy {
        max_age: storage.wal_checkpoint_interval,
        max_size_bytes: storage.wal_checkpoint_size_mb * 1024 * 1024,
    };
    let poll_interval = storage.wal_checkpoint_interval.min(std::time::Duration::from_secs(60)).max(std::time::Duration::from_secs(1));
    let mut state = CheckpointState::default();
    let mut ticker = Ticker::new(poll_interval, cancel);

    loop {
        match ticker.tick().await {
            Tick::Cancelled => return,
            Tick::Elapsed => match store.checkpoint_if_needed(&policy, &mut state).await {
                Ok(_) => {
                    let wal_size = store.wal_size().unwrap_or(0);
                    let (status, message) = health::evaluate_storage(wal_size, false);
                    health.update("storage", ComponentKind::Storage, status, message, BTreeMap::new());
                }
                Err(err) => {
                    tracing::error!(error = %err, "WAL checkpoint failed");
                    health.update("storage", ComponentKind::Storage, Status::Error, err.to_string(), BTreeMap::new());
                }
            },
        }
    }
}

fn auth_token(remote: &RemoteConfig) -> Result<Option<String>, Error> {
    if let Some(token) = &remote.auth_token {
        return Ok(Some(token.clone()));
    }
    if let Some(path) = &remote.auth_token_file {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::AuthTokenFile { path: path.clone(), source })?;
        return Ok(Some(contents.trim().to_string()));
    }
    Ok(None)
}

/// Runs the uploader on `remote.upload_interval` until cancelled: queries
/// a batch of unuploaded rows, chunks them, and uploads sequentially,
/// stopping the cycle at the first chunk that fails (spec.md §5, §7).
pub async fn uploader_task(
    remote: RemoteConfig,
    device_id: String,
    store: QueueStore,
    health: HealthRegistry,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let uploader_config = UploaderConfig {
        url: remote.url.clone().unwrap_or_default(),
        device_id: device_id.clone(),
        auth_token: auth_token(&remote)?,
        max_retries: retry_attempts(&remote).saturating_sub(1),
        initial_delay: remote.retry.initial_backoff,
        backoff_multiplier: remote.retry.backoff_multiplier,
        max_delay: remote.retry.max_backoff,
        jitter_percent: remote.retry.jitter_percent.unwrap_or(20.0),
        ..UploaderConfig::default()
    };
    let uploader = Uploader::new(uploader_config).map_err(Error::Uploader)?;
    let chunker_config = chunking::ChunkerConfig {
        chunk_size: remote.chunk_size,
        ..chunking::ChunkerConfig::default()
    };
    let thresholds = Thresholds::from_upload_period(remote.upload_interval, 0);
    let mut last_success: Option<Instant> = None;

    let mut ticker = Ticker::new(remote.upload_interval, cancel.clone());
    loop {
        match ticker.tick().await {
            Tick::Cancelled => return Ok(()),
            Tick::Elapsed => {
                run_upload_cycle(&store, &uploader, &chunker_config, remote.batch_size, &cancel, &mut last_success, &health, &thresholds).await;
            }
        }
    }
}

/// Retries are enabled unless explicitly disabled; a disabled policy is a
/// single attempt.
fn retry_attempts(remote: &RemoteConfig) -> u32 {
    if remote.retry.enabled == Some(false) {
        1
    } else {
        remote.retry.max_attempts.max(1)
    }
}

async fn run_upload_cycle(
    store: &QueueStore,
    uploader: &Uploader,
    chunker_config: &chunking::ChunkerConfig,
    batch_size: usize,
    cancel: &CancellationToken,
    last_success: &mut Option<Instant>,
    health: &HealthRegistry,
    thresholds: &Thresholds,
) {
    let rows = match store.query_unuploaded(batch_size).await {
        Ok(rows) => rows,
        Err(err) => {
            health.update("uploader", ComponentKind::Uploader, Status::Error, err.to_string(), BTreeMap::new());
            return;
        }
    };

    if rows.is_empty() {
        report_uploader_health(store, *last_success, None, health, thresholds).await;
        return;
    }

    let chunks = match chunking::build_chunks(rows, chunker_config) {
        Ok(chunks) => chunks,
        Err(err) => {
            health.update("uploader", ComponentKind::Uploader, Status::Error, err.to_string(), BTreeMap::new());
            return;
        }
    };

    for (index, chunk) in chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            return;
        }

        match uploader.upload_chunk(chunk, index, cancel).await {
            ChunkOutcome::Uploaded => {
                if let Err(err) = store.mark_uploaded(chunk.row_ids.clone()).await {
                    health.update("uploader", ComponentKind::Uploader, Status::Error, err.to_string(), BTreeMap::new());
                    return;
                }
                *last_success = Some(Instant::now());
            }
            ChunkOutcome::Failed { last_status } => {
                let message = format!("chunk {index} failed after retries (status {last_status:?})");
                tracing::error!(chunk_index = index, status = ?last_status, "upload cycle stopped");
                health.update("uploader", ComponentKind::Uploader, Status::Error, message, BTreeMap::new());
                return;
            }
            ChunkOutcome::Cancelled => return,
        }
    }

    report_uploader_health(store, *last_success, None, health, thresholds).await;
}

async fn report_uploader_health(
    store: &QueueStore,
    last_success: Option<Instant>,
    last_error: Option<&str>,
    health: &HealthRegistry,
    thresholds: &Thresholds,
) {
    let pending = store.pending_count().await.unwrap_or(0);
    let (status, message) = health::evaluate_uploader(last_success.map(|t| t.elapsed()), last_error, pending, thresholds);
    health.update("uploader", ComponentKind::Uploader, status, message, BTreeMap::new());
}

/// Samples the agent's own queue depth and on-disk store size on a fixed
/// interval, storing them as ordinary samples (spec.md §4.7's
/// "self-telemetry poller") so they flow through the same upload path.
pub async fn self_telemetry_task(device_id: String, store: QueueStore, cancel: CancellationToken) {
    let mut ticker = Ticker::new(SELF_TELEMETRY_INTERVAL, cancel);

    loop {
        match ticker.tick().await {
            Tick::Cancelled => return,
            Tick::Elapsed => {
                let now_ms = now_millis();
                let pending = store.pending_count().await.unwrap_or(0) as f64;
                let db_size = store.db_size().unwrap_or(0) as f64;

                let samples = [
                    Sample::new("agent.queue_pending_count", device_id.clone(), now_ms, ValueKind::Numeric(pending), []),
                    Sample::new("agent.store_size_bytes", device_id.clone(), now_ms, ValueKind::Numeric(db_size), []),
                ];

                let samples: Vec<_> = samples.into_iter().filter_map(Result::ok).collect();
                if let Err(err) = store.store_batch(samples).await {
                    tracing::warn!(error = %err, "failed to store self-telemetry samples");
                }
            }
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Runs the clock-skew probe on `monitoring.clock_skew_check_interval`
/// until cancelled. A no-op if `clock_skew_url` is unset.
pub async fn clockskew_task(
    monitoring: MonitoringConfig,
    remote: RemoteConfig,
    device_id: String,
    store: QueueStore,
    health: HealthRegistry,
    upload_period: std::time::Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let Some(url) = monitoring.clock_skew_url.clone() else {
        return Ok(());
    };

    let probe_config = clockskew::ClockSkewConfig {
        url,
        auth_token: auth_token(&remote)?,
        warn_threshold_ms: monitoring.clock_skew_warn_threshold_ms,
        request_timeout: std::time::Duration::from_secs(10),
    };
    let mut probe = clockskew::ClockSkewProbe::new(probe_config).map_err(Error::ClockSkew)?;
    let thresholds = Thresholds::from_upload_period(upload_period, monitoring.clock_skew_warn_threshold_ms);

    let mut ticker = Ticker::new(monitoring.clock_skew_check_interval, cancel.clone());
    loop {
        match ticker.tick().await {
            Tick::Cancelled => return Ok(()),
            Tick::Elapsed => match probe.probe(&device_id).await {
                Ok(sample) => {
                    let skew_ms = match sample.value() {
                        ValueKind::Numeric(v) => *v as i64,
                        ValueKind::Text(_) => 0,
                    };
                    if let Err(err) = store.store_batch(vec![sample]).await {
                        tracing::error!(error = %err, "failed to store clock-skew sample");
                    }
                    let (status, message) = health::evaluate_clock(Some(skew_ms), false, &thresholds);
                    health.update("clock", ComponentKind::Clock, status, message, BTreeMap::new());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "clock-skew probe failed");
                    let (status, message) = health::evaluate_clock(None, true, &thresholds);
                    health.update("clock", ComponentKind::Clock, status, message, BTreeMap::new());
                }
            },
        }
    }
}
