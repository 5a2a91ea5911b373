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

//! The `Sample` type: a single timestamped metric observation plus the
//! content fingerprint used as its durable idempotency key.

use std::collections::BTreeMap;

/// All the errors that can occur while building a `Sample`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A numeric value was not finite (`NaN` or `+/-Inf`).
    #[error("non-finite numeric value (name: {name}, value: {value})")]
    NonFiniteValue {
        /// The sample name.
        name: String,
        /// The offending value.
        value: f64,
    },
}

/// The value carried by a sample.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValueKind {
    /// A finite floating point value.
    Numeric(f64),
    /// A free-form text value. Never transmitted by the uploader.
    Text(String),
}

impl ValueKind {
    /// Returns the single-byte discriminant used by the fingerprint and by
    /// the store's `value_kind` column.
    pub fn discriminant(&self) -> u8 {
        match self {
            ValueKind::Numeric(_) => 0,
            ValueKind::Text(_) => 1,
        }
    }

    /// Returns true if this is a `Numeric` value.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueKind::Numeric(_))
    }
}

/// A single timestamped observation with optional tags.
///
/// Tags are kept in a `BTreeMap` so that iteration order is always the
/// lexical order required by the fingerprint and by wire serialization;
/// insertion order has no semantic meaning (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    name: String,
    device_id: String,
    timestamp_ms: i64,
    value: ValueKind,
    tags: BTreeMap<String, String>,
}

impl Sample {
    /// Creates a new sample. Rejects `NaN`/`+/-Inf` numeric values, per
    /// spec.md §3.
    pub fn new(
        name: impl Into<String>,
        device_id: impl Into<String>,
        timestamp_ms: i64,
        value: ValueKind,
        tags: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if let ValueKind::Numeric(v) = value {
            if !v.is_finite() {
                return Err(Error::NonFiniteValue { name, value: v });
            }
        }

        Ok(Self {
            device_id: device_id.into(),
            timestamp_ms,
            value,
            tags: tags.into_iter().collect(),
            name,
        })
    }

    /// The dotted metric name, e.g. `cpu.temperature`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device identifier this sample was collected on.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Unix timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The sample's value.
    pub fn value(&self) -> &ValueKind {
        &self.value
    }

    /// Tags, in lexical key order.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The deterministic content fingerprint of this sample (spec.md §4.2).
    ///
    /// Computed over a canonical, length-prefixed byte encoding of
    /// `(name, device_id, timestamp_ms, kind discriminant, canonical value,
    /// tags sorted by key)`. The numeric value is encoded via its IEEE-754
    /// bit pattern so that textual rounding never changes the fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();

        write_len_prefixed(&mut hasher, self.name.as_bytes());
        write_len_prefixed(&mut hasher, self.device_id.as_bytes());
        let _ = hasher.update(&self.timestamp_ms.to_le_bytes());
        let _ = hasher.update(&[self.value.discriminant()]);

        match &self.value {
            ValueKind::Numeric(v) => {
                let _ = hasher.update(&v.to_bits().to_le_bytes());
            }
            ValueKind::Text(s) => write_len_prefixed(&mut hasher, s.as_bytes()),
        }

        // BTreeMap iteration is already key-sorted; spec.md also requires
        // ties on value but keys are unique per sample so this is moot.
        for (k, v) in &self.tags {
            write_len_prefixed(&mut hasher, k.as_bytes());
            write_len_prefixed(&mut hasher, v.as_bytes());
        }

        Fingerprint(*hasher.finalize().as_bytes())
    }
}

fn write_len_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    let _ = hasher.update(&(bytes.len() as u64).to_le_bytes());
    let _ = hasher.update(bytes);
}

/// A deterministic, wide (256-bit) content hash identifying a sample's
/// logical identity for the store's dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Returns the raw bytes of the fingerprint.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Renders the fingerprint as a lowercase hex string, the form stored in
    /// the queue's unique index.
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(name: &str, value: ValueKind, tags: &[(&str, &str)]) -> Sample {
        Sample::new(
            name,
            "device-1",
            1_700_000_000_000,
            value,
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .expect("valid sample")
    }

    #[test]
    fn rejects_nan_and_infinite() {
        assert!(Sample::new("cpu.temperature", "d1", 0, ValueKind::Numeric(f64::NAN), []).is_err());
        assert!(Sample::new("cpu.temperature", "d1", 0, ValueKind::Numeric(f64::INFINITY), []).is_err());
        assert!(Sample::new("cpu.temperature", "d1", 0, ValueKind::Numeric(f64::NEG_INFINITY), []).is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("core", "0")]);
        let b = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("core", "0")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_tag_insertion_order() {
        let a = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("core", "0"), ("zone", "a")]);
        let b = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("zone", "a"), ("core", "0")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_any_observable_field() {
        let base = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("core", "0")]);
        let other_value = sample("cpu.temperature", ValueKind::Numeric(45.1), &[("core", "0")]);
        let other_name = sample("cpu.other", ValueKind::Numeric(45.0), &[("core", "0")]);
        let other_tag = sample("cpu.temperature", ValueKind::Numeric(45.0), &[("core", "1")]);

        assert_ne!(base.fingerprint(), other_value.fingerprint());
        assert_ne!(base.fingerprint(), other_name.fingerprint());
        assert_ne!(base.fingerprint(), other_tag.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_kind() {
        let numeric = sample("stream.loss_ratio", ValueKind::Numeric(0.0), &[]);
        let text = sample("stream.loss_ratio", ValueKind::Text("0".to_string()), &[]);
        assert_ne!(numeric.fingerprint(), text.fingerprint());
    }
}
