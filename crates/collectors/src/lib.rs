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

//! The collector interface (spec.md §6) and the agent's built-in mock
//! producers (spec.md §11): `cpu.load`, `memory.used`, `disk.free_bytes`,
//! `network.rx_bytes`/`network.tx_bytes`, `system.thermal_celsius`, and
//! `stream.loss_ratio`.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use sample::{Sample, ValueKind};
use tokio_util::sync::CancellationToken;

/// All the errors a collector can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The collector could not produce a reading this cycle.
    #[error("collection failed: {reason}")]
    CollectionFailed {
        /// A human-readable description of the failure.
        reason: String,
    },
}

/// A metric producer with a stable name, invoked on its own configured
/// period by the supervisor (spec.md §6).
#[async_trait]
pub trait Collector: Send {
    /// The collector's stable name, used in logs and health reports.
    fn name(&self) -> &str;

    /// Produces zero or more samples for this cycle. `cancel` should be
    /// checked before any suspension point; a cancelled collector returns
    /// an empty list rather than an error.
    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error>;
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as i64
}

fn numeric(name: &str, device_id: &str, value: f64) -> Sample {
    Sample::new(name, device_id, now_ms(), ValueKind::Numeric(value), []).expect("mock collector values are always finite")
}

/// Tracks a kernel-exported monotonic counter and applies the wraparound
/// rule from spec.md §9: a reading lower than the previous one is dropped
/// and the baseline is reset to it, never interpolated.
#[derive(Debug, Default)]
pub struct CounterBaseline {
    previous: Option<u64>,
}

impl CounterBaseline {
    /// Creates a tracker with no prior baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes a raw counter reading. Returns `Some(raw)` to emit, or
    /// `None` if this reading wrapped and should be dropped.
    pub fn observe(&mut self, raw: u64) -> Option<u64> {
        match self.previous {
            Some(prev) if raw < prev => {
                self.previous = Some(raw);
                None
            }
            _ => {
                self.previous = Some(raw);
                Some(raw)
            }
        }
    }
}

/// Mock CPU load average collector.
pub struct CpuLoadCollector {
    device_id: String,
}

impl CpuLoadCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }
}

#[async_trait]
impl Collector for CpuLoadCollector {
    fn name(&self) -> &str {
        "cpu.load"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }
        let load = rand::thread_rng().gen_range(0.0..4.0);
        Ok(vec![numeric(self.name(), &self.device_id, load)])
    }
}

/// Mock resident memory usage collector, in bytes.
pub struct MemoryUsedCollector {
    device_id: String,
}

impl MemoryUsedCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }
}

#[async_trait]
impl Collector for MemoryUsedCollector {
    fn name(&self) -> &str {
        "memory.used"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }
        let bytes = rand::thread_rng().gen_range(1.0e8..8.0e8);
        Ok(vec![numeric(self.name(), &self.device_id, bytes)])
    }
}

/// Mock free disk space collector, in bytes.
pub struct DiskFreeBytesCollector {
    device_id: String,
}

impl DiskFreeBytesCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }
}

#[async_trait]
impl Collector for DiskFreeBytesCollector {
    fn name(&self) -> &str {
        "disk.free_bytes"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }
        let bytes = rand::thread_rng().gen_range(1.0e9..5.0e10);
        Ok(vec![numeric(self.name(), &self.device_id, bytes)])
    }
}

/// Mock network byte-counter collector, applying the wraparound rule to
/// both the receive and transmit counters.
pub struct NetworkBytesCollector {
    device_id: String,
    rx_total: u64,
    tx_total: u64,
    rx_baseline: CounterBaseline,
    tx_baseline: CounterBaseline,
}

impl NetworkBytesCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            rx_total: 0,
            tx_total: 0,
            rx_baseline: CounterBaseline::new(),
            tx_baseline: CounterBaseline::new(),
        }
    }
}

#[async_trait]
impl Collector for NetworkBytesCollector {
    fn name(&self) -> &str {
        "network.bytes"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }

        let mut rng = rand::thread_rng();
        self.rx_total = self.rx_total.wrapping_add(rng.gen_range(0..65_536));
        self.tx_total = self.tx_total.wrapping_add(rng.gen_range(0..65_536));

        let mut samples = Vec::with_capacity(2);
        if let Some(rx) = self.rx_baseline.observe(self.rx_total) {
            samples.push(numeric("network.rx_bytes", &self.device_id, rx as f64));
        }
        if let Some(tx) = self.tx_baseline.observe(self.tx_total) {
            samples.push(numeric("network.tx_bytes", &self.device_id, tx as f64));
        }
        Ok(samples)
    }
}

/// Mock thermal sensor collector, in degrees Celsius.
pub struct ThermalCollector {
    device_id: String,
}

impl ThermalCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }
}

#[async_trait]
impl Collector for ThermalCollector {
    fn name(&self) -> &str {
        "system.thermal_celsius"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }
        let celsius = rand::thread_rng().gen_range(30.0..70.0);
        Ok(vec![numeric(self.name(), &self.device_id, celsius)])
    }
}

/// Mock streaming-loss-ratio collector (a synthetic stat unrelated to the
/// host, included to exercise a metric that never needs the counter
/// heuristic or a unit suffix).
pub struct StreamLossCollector {
    device_id: String,
}

impl StreamLossCollector {
    /// Creates a new collector reporting for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }
}

#[async_trait]
impl Collector for StreamLossCollector {
    fn name(&self) -> &str {
        "stream.loss_ratio"
    }

    async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<Sample>, Error> {
        if cancel.is_cancelled() {
            return Ok(vec![]);
        }
        let ratio = rand::thread_rng().gen_range(0.0..0.05);
        Ok(vec![numeric(self.name(), &self.device_id, ratio)])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_baseline_passes_through_increasing_readings() {
        let mut baseline = CounterBaseline::new();
        assert_eq!(baseline.observe(10), Some(10));
        assert_eq!(baseline.observe(20), Some(20));
    }

    #[test]
    fn counter_baseline_drops_and_resets_on_wraparound() {
        let mut baseline = CounterBaseline::new();
        assert_eq!(baseline.observe(100), Some(100));
        assert_eq!(baseline.observe(10), None);
        // The baseline is now 10; a further increase is accepted normally.
        assert_eq!(baseline.observe(15), Some(15));
    }

    #[tokio::test]
    async fn cancelled_collectors_return_no_samples() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut collector = CpuLoadCollector::new("d1");
        let samples = collector.collect(&cancel).await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn network_collector_emits_both_counters_every_cycle() {
        let cancel = CancellationToken::new();
        let mut collector = NetworkBytesCollector::new("d1");
        let samples = collector.collect(&cancel).await.unwrap();
        assert_eq!(samples.len(), 2);
        let names: Vec<&str> = samples.iter().map(|s| s.name()).collect();
        assert!(names.contains(&"network.rx_bytes"));
        assert!(names.contains(&"network.tx_bytes"));
    }

    #[tokio::test]
    async fn collectors_carry_the_configured_device_id() {
        let cancel = CancellationToken::new();
        let mut collector = ThermalCollector::new("device-xyz");
        let samples = collector.collect(&cancel).await.unwrap();
        assert_eq!(samples[0].device_id(), "device-xyz");
    }
}
