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

//! The agent's YAML configuration schema and loader (spec.md §6).
//!
//! `retry.enabled` and `jitter_percent` are tri-state: `Option<T>`
//! distinguishes "unset, use the default" from "explicitly set to
//! zero/false, honor it exactly" (spec.md §9).

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Errors raised while loading or validating the configuration file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be read from disk.
    #[error("could not read configuration file `{path}`: {source}")]
    Read {
        /// The configured file path.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file was not valid YAML, or did not match the
    /// expected schema.
    #[error("could not parse configuration file `{path}`: {source}")]
    Parse {
        /// The configured file path.
        path: String,
        /// The underlying parse error.
        source: serde_yaml::Error,
    },

    /// The configuration parsed but violated a semantic rule (a range, a
    /// required field, or a mutual-exclusivity constraint).
    #[error("invalid configuration in `{path}`: {message}")]
    Invalid {
        /// The configured file path.
        path: String,
        /// A human-readable description of the violated rule.
        message: String,
    },
}

/// Identifies the device this agent instance reports telemetry for.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct DeviceConfig {
    /// The device identifier attached to every emitted sample.
    #[validate(length(min = 1))]
    pub id: String,
}

fn default_wal_checkpoint_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_wal_checkpoint_size_mb() -> u64 {
    64
}

/// The local queue store's on-disk location and checkpoint policy.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct StorageConfig {
    /// The queue database path (spec.md §6 storage path normalization).
    #[validate(length(min = 1))]
    pub path: String,

    /// How often the WAL is checkpointed on a timer, independent of size.
    #[serde(default = "default_wal_checkpoint_interval", with = "humantime_serde")]
    pub wal_checkpoint_interval: Duration,

    /// The WAL size, in megabytes, above which an out-of-cycle checkpoint
    /// is triggered.
    #[serde(default = "default_wal_checkpoint_size_mb")]
    #[validate(range(min = 1))]
    pub wal_checkpoint_size_mb: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry/backoff policy for the HTTP uploader.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct RetryConfig {
    /// Tri-state: `None` means "use the default" (retries enabled).
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Total attempts per upload cycle, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on any computed retry delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Tri-state: `None` defaults to 20%; an explicit `0.0` is honored.
    #[serde(default)]
    pub jitter_percent: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_percent: None,
        }
    }
}

fn default_upload_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    2500
}

fn default_chunk_size() -> usize {
    50
}

/// Remote upload destination and retry policy.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct RemoteConfig {
    /// Whether the uploader task runs at all.
    #[serde(default)]
    pub enabled: bool,

    /// The ingest endpoint URL. Required when `enabled` is true.
    pub url: Option<String>,

    /// How often an upload cycle runs.
    #[serde(default = "default_upload_interval", with = "humantime_serde")]
    pub upload_interval: Duration,

    /// Maximum number of rows considered per upload cycle.
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Maximum number of samples per wire chunk before compression.
    #[serde(default = "default_chunk_size")]
    #[validate(range(min = 1))]
    pub chunk_size: usize,

    /// A bearer token supplied directly in the config file. Mutually
    /// exclusive with `auth_token_file`.
    pub auth_token: Option<String>,

    /// A path to a file containing the bearer token. Mutually exclusive
    /// with `auth_token`.
    pub auth_token_file: Option<String>,

    /// The retry/backoff policy.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            upload_interval: default_upload_interval(),
            batch_size: default_batch_size(),
            chunk_size: default_chunk_size(),
            auth_token: None,
            auth_token_file: None,
            retry: RetryConfig::default(),
        }
    }
}

fn default_clock_skew_check_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_clock_skew_warn_threshold_ms() -> i64 {
    2000
}

fn default_health_address() -> String {
    ":9100".to_string()
}

/// Clock-skew probing and the health HTTP surface.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct MonitoringConfig {
    /// URL probed for clock skew. If unset, the clock-skew task does not
    /// run.
    pub clock_skew_url: Option<String>,

    /// How often the clock-skew probe runs. A non-positive value falls
    /// back to the default with a warning rather than failing config load.
    #[serde(default = "default_clock_skew_check_interval", with = "humantime_serde")]
    pub clock_skew_check_interval: Duration,

    /// Absolute skew, in milliseconds, above which a warning is logged.
    #[serde(default = "default_clock_skew_warn_threshold_ms")]
    pub clock_skew_warn_threshold_ms: i64,

    /// The bind address for the `/health` HTTP surface.
    #[serde(default = "default_health_address")]
    #[validate(length(min = 1))]
    pub health_address: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            clock_skew_url: None,
            clock_skew_check_interval: default_clock_skew_check_interval(),
            clock_skew_warn_threshold_ms: default_clock_skew_warn_threshold_ms(),
            health_address: default_health_address(),
        }
    }
}

fn default_metric_enabled() -> bool {
    true
}

/// One entry in the per-metric collection schedule.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct MetricConfig {
    /// The collector name this entry schedules (matched against
    /// `Collector::name`).
    #[validate(length(min = 1))]
    pub name: String,

    /// How often the collector is invoked. Must be strictly positive.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Whether this collector is scheduled at all.
    #[serde(default = "default_metric_enabled")]
    pub enabled: bool,
}

/// The fully parsed and validated agent configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct AgentConfig {
    /// Device identity.
    #[validate(nested)]
    pub device: DeviceConfig,

    /// Local queue store settings.
    #[validate(nested)]
    pub storage: StorageConfig,

    /// Remote upload settings.
    #[serde(default)]
    #[validate(nested)]
    pub remote: RemoteConfig,

    /// Clock-skew and health settings.
    #[serde(default)]
    #[validate(nested)]
    pub monitoring: MonitoringConfig,

    /// The per-metric collection schedule.
    #[serde(default)]
    #[validate(nested)]
    pub metrics: Vec<MetricConfig>,
}

/// Loads, parses, and validates the configuration file at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<AgentConfig, Error> {
    let path = path.as_ref();
    let display_path = path.display().to_string();

    let raw = fs::read_to_string(path).map_err(|source| Error::Read {
        path: display_path.clone(),
        source,
    })?;

    let mut config: AgentConfig = serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
        path: display_path.clone(),
        source,
    })?;

    config.validate().map_err(|source| Error::Invalid {
        path: display_path.clone(),
        message: source.to_string(),
    })?;

    validate_semantics(&config, &display_path)?;
    normalize_clock_skew_interval(&mut config, &display_path);

    Ok(config)
}

/// Checks the rules `validator::Validate` cannot express: durations that
/// must be strictly positive (spec.md §8 invariant 11), required fields
/// conditioned on another field, and mutual exclusivity between sibling
/// fields.
fn validate_semantics(config: &AgentConfig, path: &str) -> Result<(), Error> {
    let invalid = |message: String| Error::Invalid {
        path: path.to_string(),
        message,
    };

    if config.storage.wal_checkpoint_interval.is_zero() {
        return Err(invalid("storage.wal_checkpoint_interval must be greater than zero".to_string()));
    }

    if config.remote.enabled && config.remote.url.is_none() {
        return Err(invalid("remote.url is required when remote.enabled is true".to_string()));
    }

    if config.remote.upload_interval.is_zero() {
        return Err(invalid("remote.upload_interval must be greater than zero".to_string()));
    }

    if config.remote.auth_token.is_some() && config.remote.auth_token_file.is_some() {
        return Err(invalid("remote.auth_token and remote.auth_token_file are mutually exclusive".to_string()));
    }

    if config.remote.retry.initial_backoff.is_zero() {
        return Err(invalid("remote.retry.initial_backoff must be greater than zero".to_string()));
    }
    if config.remote.retry.max_backoff.is_zero() {
        return Err(invalid("remote.retry.max_backoff must be greater than zero".to_string()));
    }

    for metric in &config.metrics {
        if metric.interval.is_zero() {
            return Err(invalid(format!("metrics[{}].interval must be greater than zero", metric.name)));
        }
    }

    Ok(())
}

/// Falls back `monitoring.clock_skew_check_interval` to its default when
/// configured non-positive, logging a warning rather than failing config
/// load (spec.md §6, distinct from the hard failure on a non-positive
/// checkpoint interval).
fn normalize_clock_skew_interval(config: &mut AgentConfig, path: &str) {
    if config.monitoring.clock_skew_check_interval.is_zero() {
        tracing::warn!(
            path,
            fallback_seconds = default_clock_skew_check_interval().as_secs(),
            "monitoring.clock_skew_check_interval must be positive; falling back to the default"
        );
        config.monitoring.clock_skew_check_interval = default_clock_skew_check_interval();
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.device.id, "d1");
        assert_eq!(config.storage.wal_checkpoint_size_mb, 64);
        assert!(!config.remote.enabled);
        assert_eq!(config.remote.retry.max_attempts, 3);
        assert_eq!(config.monitoring.health_address, ":9100");
    }

    #[test]
    fn missing_device_id_fails_to_parse() {
        let file = write_config(
            r#"
storage:
  path: /var/lib/agent/queue.db
"#,
        );
        assert!(matches!(load(file.path()), Err(Error::Parse { .. })));
    }

    #[test]
    fn non_positive_checkpoint_interval_is_a_config_error() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
  wal_checkpoint_interval: 0s
"#,
        );
        assert!(matches!(load(file.path()), Err(Error::Invalid { .. })));
    }

    #[test]
    fn remote_enabled_without_url_is_a_config_error() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
remote:
  enabled: true
"#,
        );
        assert!(matches!(load(file.path()), Err(Error::Invalid { .. })));
    }

    #[test]
    fn both_auth_token_forms_is_a_config_error() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
remote:
  enabled: true
  url: https://example.com/ingest
  auth_token: abc
  auth_token_file: /etc/agent/token
"#,
        );
        assert!(matches!(load(file.path()), Err(Error::Invalid { .. })));
    }

    #[test]
    fn explicit_zero_jitter_percent_is_distinct_from_unset() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
remote:
  retry:
    jitter_percent: 0.0
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.remote.retry.jitter_percent, Some(0.0));

        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.remote.retry.jitter_percent, None);
    }

    #[test]
    fn non_positive_clock_skew_interval_falls_back_with_a_warning_not_an_error() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
monitoring:
  clock_skew_check_interval: 0s
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.monitoring.clock_skew_check_interval, default_clock_skew_check_interval());
    }

    #[test]
    fn per_metric_entries_are_parsed() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
metrics:
  - name: cpu.load
    interval: 10s
  - name: system.thermal_celsius
    interval: 1m
    enabled: false
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.metrics.len(), 2);
        assert!(config.metrics[0].enabled);
        assert!(!config.metrics[1].enabled);
    }

    #[test]
    fn zero_interval_metric_is_a_config_error() {
        let file = write_config(
            r#"
device:
  id: d1
storage:
  path: /var/lib/agent/queue.db
metrics:
  - name: cpu.load
    interval: 0s
"#,
        );
        assert!(matches!(load(file.path()), Err(Error::Invalid { .. })));
    }
}
