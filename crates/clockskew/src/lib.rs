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

//! The clock-skew probe (spec.md §4.6): a round-trip-adjusted offset
//! between the local clock and the remote server's `Date` header.

use std::time::{Duration, Instant, SystemTime};

use reqwest::Client;
use sample::{Sample, ValueKind};

/// All the errors the clock-skew probe can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The probe request itself failed (transport, DNS, timeout).
    #[error("clock-skew probe request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response carried no `Date` header.
    #[error("clock-skew probe response had no Date header")]
    MissingDateHeader,

    /// The `Date` header could not be parsed as an RFC 1123 timestamp.
    #[error("clock-skew probe response had an unparseable Date header: {value}")]
    InvalidDateHeader {
        /// The raw header value that failed to parse.
        value: String,
    },
}

/// Configuration for the clock-skew probe (spec.md §6 `monitoring.*`).
#[derive(Debug, Clone)]
pub struct ClockSkewConfig {
    /// URL to probe; any URL whose response carries a `Date` header works.
    pub url: String,
    /// Optional bearer token for the probe request.
    pub auth_token: Option<String>,
    /// Absolute skew, in milliseconds, above which a warning is logged.
    pub warn_threshold_ms: i64,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

/// Probes clock skew against a remote HTTP endpoint, rate-limiting its own
/// warning log lines to at most one per hour (spec.md §4.6).
pub struct ClockSkewProbe {
    client: Client,
    config: ClockSkewConfig,
    last_warning: Option<Instant>,
}

const WARNING_RATE_LIMIT: Duration = Duration::from_secs(3600);

impl ClockSkewProbe {
    /// Builds a new probe from `config`.
    pub fn new(config: ClockSkewConfig) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            config,
            last_warning: None,
        })
    }

    /// Runs one probe cycle, emitting a single `time.skew_ms` sample.
    pub async fn probe(&mut self, device_id: &str) -> Result<Sample, Error> {
        let t0 = SystemTime::now();

        let mut request = self.client.get(&self.config.url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let t1 = SystemTime::now();

        let date_header = response.headers().get(reqwest::header::DATE).ok_or(Error::MissingDateHeader)?;
        let date_str = date_header.to_str().map_err(|_| Error::InvalidDateHeader {
            value: format!("{date_header:?}"),
        })?;
        let server_time = httpdate::parse_http_date(date_str).map_err(|_| Error::InvalidDateHeader {
            value: date_str.to_string(),
        })?;

        let round_trip = t1.duration_since(t0).unwrap_or_default();
        let midpoint = t0 + round_trip / 2;

        let skew_ms = signed_millis_between(midpoint, server_time);

        if skew_ms.unsigned_abs() as i64 > self.config.warn_threshold_ms {
            self.warn_rate_limited(skew_ms);
        }

        let now_ms = signed_millis_since_epoch(SystemTime::now());
        Ok(Sample::new("time.skew_ms", device_id, now_ms, ValueKind::Numeric(skew_ms as f64), [])
            .expect("skew is always a finite value"))
    }

    fn warn_rate_limited(&mut self, skew_ms: i64) {
        let should_log = match self.last_warning {
            None => true,
            Some(last) => last.elapsed() >= WARNING_RATE_LIMIT,
        };
        if should_log {
            tracing::warn!(skew_ms, "clock skew exceeds warning threshold");
            self.last_warning = Some(Instant::now());
        }
    }
}

fn signed_millis_since_epoch(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Positive means `a` is ahead of `b`.
fn signed_millis_between(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod test {
    use wiremock::{
        matchers::method,
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn config(url: String) -> ClockSkewConfig {
        ClockSkewConfig {
            url,
            auth_token: None,
            warn_threshold_ms: 2000,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn probe_emits_a_skew_sample_from_the_date_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut probe = ClockSkewProbe::new(config(server.uri())).unwrap();
        let sample = probe.probe("d1").await.unwrap();
        assert_eq!(sample.name(), "time.skew_ms");
        assert_eq!(sample.device_id(), "d1");
    }

    #[test]
    fn signed_millis_between_is_negative_when_a_is_behind_b() {
        let a = SystemTime::UNIX_EPOCH;
        let b = SystemTime::UNIX_EPOCH + Duration::from_millis(500);
        assert_eq!(signed_millis_between(a, b), -500);
    }
}
