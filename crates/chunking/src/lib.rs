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

//! The chunk builder (spec.md §4.3): converts unuploaded samples into one
//! or more upload-ready, size- and count-bounded gzip blobs.

/// PromQL-safe `__name__` derivation from a dotted sample name.
pub mod sanitize;

use std::{collections::BTreeMap, io::Write};

use flate2::{write::GzEncoder, Compression};
use sample::ValueKind;
use serde::Serialize;
use store::QueuedSample;

/// All the errors that can occur while building chunks.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Gzip compression failed.
    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),

    /// A single sample, on its own, compresses past the size cap and cannot
    /// be split any further.
    #[error("sample exceeds the maximum chunk size on its own (name: {name}, row_id: {row_id})")]
    SampleTooLarge {
        /// The offending sample's name.
        name: String,
        /// The offending sample's row id.
        row_id: i64,
    },
}

/// Configuration for the chunk builder (spec.md §4.3, §6).
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Maximum number of samples per group before gzip compression
    /// (the first bound applied).
    pub chunk_size: usize,
    /// Maximum compressed size, in bytes, of a single blob (the second,
    /// hard bound; groups exceeding it are bisected).
    pub max_compressed_bytes: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_compressed_bytes: 256 * 1024,
        }
    }
}

/// One upload-ready blob: gzip-compressed NDJSON plus the row ids of the
/// samples it carries, so the uploader can call `mark_uploaded` after a
/// successful POST.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Gzip-compressed newline-delimited JSON body.
    pub compressed: Vec<u8>,
    /// Number of numeric samples carried by this chunk.
    pub metric_count: usize,
    /// Row ids of the samples carried by this chunk, in the order
    /// serialized.
    pub row_ids: Vec<i64>,
}

#[derive(Serialize)]
struct WireLine<'a> {
    metric: BTreeMap<&'a str, &'a str>,
    values: [f64; 1],
    timestamps: [i64; 1],
}

/// Builds the chunks for one upload cycle out of a cursor page of queued
/// samples. Text samples are filtered silently; remaining samples are
/// sorted by timestamp ascending before being grouped.
pub fn build_chunks(mut samples: Vec<QueuedSample>, config: &ChunkerConfig) -> Result<Vec<Chunk>, Error> {
    samples.retain(|q| q.sample.value().is_numeric());
    samples.sort_by_key(|q| q.sample.timestamp_ms());

    let mut chunks = Vec::new();
    for group in samples.chunks(config.chunk_size.max(1)) {
        if group.is_empty() {
            continue;
        }
        chunks.extend(build_group(group, config.max_compressed_bytes)?);
    }
    Ok(chunks)
}

/// Serializes and compresses `group`; if the result exceeds
/// `max_compressed_bytes`, bisects the group and recurses on each half.
fn build_group(group: &[QueuedSample], max_compressed_bytes: usize) -> Result<Vec<Chunk>, Error> {
    let compressed = compress_group(group)?;

    if compressed.len() <= max_compressed_bytes {
        return Ok(vec![Chunk {
            compressed,
            metric_count: group.len(),
            row_ids: group.iter().map(|q| q.row_id).collect(),
        }]);
    }

    if group.len() == 1 {
        return Err(Error::SampleTooLarge {
            name: group[0].sample.name().to_string(),
            row_id: group[0].row_id,
        });
    }

    let mid = group.len() / 2;
    let mut out = build_group(&group[..mid], max_compressed_bytes)?;
    out.extend(build_group(&group[mid..], max_compressed_bytes)?);
    Ok(out)
}

fn compress_group(group: &[QueuedSample]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for queued in group {
        let line = serialize_line(queued);
        encoder.write_all(line.as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

fn serialize_line(queued: &QueuedSample) -> String {
    let value = match queued.sample.value() {
        ValueKind::Numeric(v) => *v,
        ValueKind::Text(_) => unreachable!("text samples are filtered before serialization"),
    };

    let name = sanitize::sanitize_name(queued.sample.name());
    let mut metric = BTreeMap::new();
    let _ = metric.insert("__name__", name.as_str());
    let _ = metric.insert("device_id", queued.sample.device_id());
    for (k, v) in queued.sample.tags() {
        if !k.starts_with('_') {
            let _ = metric.insert(k.as_str(), v.as_str());
        }
    }

    let line = WireLine {
        metric,
        values: [value],
        timestamps: [queued.sample.timestamp_ms()],
    };
    serde_json::to_string(&line).expect("wire line always serializable")
}

#[cfg(test)]
mod test {
    use super::*;
    use sample::Sample;

    fn queued(id: i64, name: &str, ts: i64, value: f64, tags: &[(&str, &str)]) -> QueuedSample {
        QueuedSample {
            row_id: id,
            sample: Sample::new(
                name,
                "d1",
                ts,
                ValueKind::Numeric(value),
                tags.iter().map(|(k, v)| (k.to_string(), v.to_string())),
            )
            .unwrap(),
        }
    }

    #[test]
    fn chunk_size_one_produces_one_blob_per_sample() {
        let samples = vec![
            queued(1, "cpu.temperature", 0, 45.0, &[]),
            queued(2, "memory.used", 1, 1024.0, &[]),
        ];
        let config = ChunkerConfig { chunk_size: 1, ..Default::default() };
        let chunks = build_chunks(samples, &config).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metric_count, 1);
    }

    #[test]
    fn no_chunk_exceeds_the_size_cap() {
        let samples: Vec<_> = (0..200)
            .map(|i| queued(i, "network.rx_bytes", i, i as f64, &[("payload", &"x".repeat(4000))]))
            .collect();
        let config = ChunkerConfig {
            chunk_size: 100,
            max_compressed_bytes: 256 * 1024,
        };
        let chunks = build_chunks(samples.clone(), &config).unwrap();

        for chunk in &chunks {
            assert!(chunk.compressed.len() <= config.max_compressed_bytes);
        }

        let mut row_ids: Vec<i64> = chunks.iter().flat_map(|c| c.row_ids.clone()).collect();
        row_ids.sort();
        let expected: Vec<i64> = samples.iter().map(|q| q.row_id).collect();
        assert_eq!(row_ids, expected);
    }

    #[test]
    fn samples_are_sorted_by_timestamp_before_chunking() {
        let samples = vec![queued(1, "a.metric", 5, 1.0, &[]), queued(2, "b.metric", 1, 2.0, &[])];
        let chunks = build_chunks(samples, &ChunkerConfig::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].row_ids, vec![2, 1]);
    }

    #[test]
    fn text_like_internal_tags_are_stripped() {
        let sample = queued(1, "cpu.temperature", 0, 45.0, &[("_internal", "x"), ("core", "0")]);
        let line = serialize_line(&sample);
        assert!(!line.contains("_internal"));
        assert!(line.contains("\"core\":\"0\""));
    }
}
