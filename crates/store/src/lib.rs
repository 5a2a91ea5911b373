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

//! The durable metric queue (spec.md §4.1): an embedded, write-ahead-logged
//! append store with deduplication, batch insertion, unuploaded-cursor
//! queries, and periodic compaction.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sample::{Fingerprint, Sample, ValueKind};

/// All the errors that can occur while using the queue store.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The underlying SQLite engine returned an error.
    #[error("storage I/O error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking storage task failed to run to completion.
    #[error("storage task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Sample construction failed while deserializing a stored row.
    #[error("corrupted row (id: {row_id}, reason: {reason})")]
    CorruptedRow {
        /// The row id of the offending row.
        row_id: i64,
        /// The reason the row could not be reconstructed.
        reason: String,
    },

    /// Filesystem metadata for the store or its WAL could not be read.
    #[error("failed to stat storage file {path}: {source}")]
    Stat {
        /// The path that could not be stat'd.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// A row read back from the store via [`QueueStore::query_unuploaded`].
///
/// Carries its row id as the opaque attribute the uploader round-trips back
/// through [`QueueStore::mark_uploaded`] (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct QueuedSample {
    /// The store-assigned, strictly increasing row id.
    pub row_id: i64,
    /// The sample itself.
    pub sample: Sample,
}

/// Durable queue store backed by a single SQLite connection running in
/// WAL mode.
///
/// SQLite calls block the calling thread, so every operation here is run via
/// `tokio::task::spawn_blocking`, keeping the executor's worker threads free
/// for the rest of the agent (spec.md §5: only storage I/O may suspend).
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    wal_path: PathBuf,
}

impl QueueStore {
    /// Opens (creating if necessary) the store at `path`, applying the
    /// WAL-mode tuning pragmas from spec.md §5: `journal_mode=WAL`,
    /// `synchronous=NORMAL`, `busy_timeout≈10s`, `temp_store=MEMORY`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 10_000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS samples (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                device_id   TEXT NOT NULL,
                ts_ms       INTEGER NOT NULL,
                kind        INTEGER NOT NULL,
                value       REAL,
                text_value  TEXT,
                tags        TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                uploaded    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_unuploaded_cursor
                ON samples (uploaded, kind, id);",
        )?;

        let wal_path = wal_path_for(&db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            wal_path,
        })
    }

    /// Inserts a batch of samples atomically. Byte-identical duplicates
    /// (matching fingerprint) are silently skipped. Returns the number of
    /// rows newly inserted.
    pub async fn store_batch(&self, samples: Vec<Sample>) -> Result<usize, Error> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("store connection mutex poisoned");
            let tx = conn.transaction()?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO samples
                        (name, device_id, ts_ms, kind, value, text_value, tags, fingerprint)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;

                for sample in &samples {
                    let fingerprint = sample.fingerprint().to_hex();
                    let (value, text_value) = match sample.value() {
                        ValueKind::Numeric(v) => (Some(*v), None),
                        ValueKind::Text(s) => (None, Some(s.clone())),
                    };
                    let tags = serde_json::to_string(sample.tags()).expect("tag map always serializable");

                    let changed = stmt.execute(params![
                        sample.name(),
                        sample.device_id(),
                        sample.timestamp_ms(),
                        sample.value().discriminant(),
                        value,
                        text_value,
                        tags,
                        fingerprint,
                    ])?;
                    inserted += changed;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await?
    }

    /// Returns up to `limit` rows with `uploaded=false` and a `Numeric`
    /// value, ordered by row id ascending. Does not mutate state.
    pub async fn query_unuploaded(&self, limit: usize) -> Result<Vec<QueuedSample>, Error> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT id, name, device_id, ts_ms, value, tags
                 FROM samples
                 WHERE uploaded = 0 AND kind = 0
                 ORDER BY id ASC
                 LIMIT ?1",
            )?;

            let rows = stmt.query_map(params![limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let name: String = row.get(1)?;
                let device_id: String = row.get(2)?;
                let ts_ms: i64 = row.get(3)?;
                let value: f64 = row.get(4)?;
                let tags_json: String = row.get(5)?;
                Ok((id, name, device_id, ts_ms, value, tags_json))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, name, device_id, ts_ms, value, tags_json) = row?;
                let tags: BTreeMap<String, String> = serde_json::from_str(&tags_json).map_err(|e| Error::CorruptedRow {
                    row_id: id,
                    reason: e.to_string(),
                })?;
                let sample = Sample::new(name, device_id, ts_ms, ValueKind::Numeric(value), tags).map_err(|e| {
                    Error::CorruptedRow {
                        row_id: id,
                        reason: e.to_string(),
                    }
                })?;
                out.push(QueuedSample { row_id: id, sample });
            }
            Ok(out)
        })
        .await?
    }

    /// Marks the listed row ids as uploaded in a single atomic transaction.
    /// Idempotent: re-marking already-uploaded rows succeeds.
    pub async fn mark_uploaded(&self, ids: Vec<i64>) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("store connection mutex poisoned");
            let tx = conn.transaction()?;
            {
                let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
                let sql = format!("UPDATE samples SET uploaded = 1 WHERE id IN ({placeholders})");
                let mut stmt = tx.prepare(&sql)?;
                let _ = stmt.execute(params_from_iter(ids.iter()))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Number of rows with `uploaded=false` and a `Numeric` value. Text
    /// rows never count toward this gauge (spec.md §3, §4.5).
    pub async fn pending_count(&self) -> Result<u64, Error> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM samples WHERE uploaded = 0 AND kind = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await?
    }

    /// Looks up whether a specific fingerprint is already stored, mainly
    /// useful for tests asserting dedup behavior.
    pub async fn contains_fingerprint(&self, fingerprint: Fingerprint) -> Result<bool, Error> {
        let conn = self.conn.clone();
        let hex = fingerprint.to_hex();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            let found: Option<i64> = conn
                .query_row("SELECT id FROM samples WHERE fingerprint = ?1", params![hex], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await?
    }

    /// Byte size of the main store file.
    pub fn db_size(&self) -> Result<u64, Error> {
        file_size(&self.db_path)
    }

    /// Byte size of the write-ahead log (0 if absent, e.g. right after a
    /// checkpoint).
    pub fn wal_size(&self) -> Result<u64, Error> {
        match std::fs::metadata(&self.wal_path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(Error::Stat {
                path: self.wal_path.clone(),
                source,
            }),
        }
    }

    /// Collapses the write-ahead log into the main store file.
    pub async fn checkpoint(&self) -> Result<(), Error> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await?
    }
}

fn file_size(path: &Path) -> Result<u64, Error> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(Error::Stat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut wal = db_path.as_os_str().to_owned();
    wal.push("-wal");
    PathBuf::from(wal)
}

/// The two thresholds that drive the WAL checkpoint loop (spec.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    /// Maximum age since the last checkpoint before one is forced.
    pub max_age: Duration,
    /// Maximum WAL size, in bytes, before a checkpoint is forced.
    pub max_size_bytes: u64,
}

impl CheckpointPolicy {
    /// Default policy: 1 hour / 64 MiB, as specified in spec.md §4.1.
    pub fn defaults() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            max_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Mutable state tracked by the checkpoint loop between ticks.
pub struct CheckpointState {
    last_checkpoint: Instant,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            last_checkpoint: Instant::now(),
        }
    }
}

impl QueueStore {
    /// Checks the two checkpoint thresholds and, if either is crossed,
    /// performs a truncating checkpoint and resets both counters. Returns
    /// whether a checkpoint was performed.
    pub async fn checkpoint_if_needed(
        &self,
        policy: &CheckpointPolicy,
        state: &mut CheckpointState,
    ) -> Result<bool, Error> {
        let age_exceeded = state.last_checkpoint.elapsed() >= policy.max_age;
        let size_exceeded = self.wal_size()? >= policy.max_size_bytes;

        if age_exceeded || size_exceeded {
            self.checkpoint().await?;
            state.last_checkpoint = Instant::now();
            tracing::debug!(age_exceeded, size_exceeded, "WAL checkpoint performed");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sample::ValueKind;

    fn sample(name: &str, ts: i64, value: f64) -> Sample {
        Sample::new(name, "device-1", ts, ValueKind::Numeric(value), []).unwrap()
    }

    fn text_sample(name: &str, ts: i64, value: &str) -> Sample {
        Sample::new(name, "device-1", ts, ValueKind::Text(value.to_string()), []).unwrap()
    }

    #[tokio::test]
    async fn store_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

        let inserted = store
            .store_batch(vec![sample("cpu.temperature", 1, 45.0), sample("memory.used", 2, 1024.0)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.pending_count().await.unwrap(), 2);

        let rows = store.query_unuploaded(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].row_id < rows[1].row_id);

        store.mark_uploaded(rows.iter().map(|r| r.row_id).collect()).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_batches_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

        let batch = vec![sample("cpu.temperature", 1, 45.0), sample("memory.used", 2, 1024.0)];
        let first = store.store_batch(batch.clone()).await.unwrap();
        let second = store.store_batch(batch).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn contains_fingerprint_reflects_dedup_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

        let cpu = sample("cpu.temperature", 1, 45.0);
        let fingerprint = cpu.fingerprint();
        assert!(!store.contains_fingerprint(fingerprint).await.unwrap());

        store.store_batch(vec![cpu.clone()]).await.unwrap();
        assert!(store.contains_fingerprint(fingerprint).await.unwrap());

        // Re-inserting the byte-identical sample is a no-op; the fingerprint
        // still resolves to the single stored row.
        store.store_batch(vec![cpu]).await.unwrap();
        assert!(store.contains_fingerprint(fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn text_samples_are_stored_but_excluded_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

        store
            .store_batch(vec![sample("cpu.temperature", 1, 45.0), text_sample("log.event", 2, "boot")])
            .await
            .unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 1);
        let rows = store.query_unuploaded(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample.name(), "cpu.temperature");
    }

    #[tokio::test]
    async fn mark_uploaded_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
        store.store_batch(vec![sample("cpu.temperature", 1, 45.0)]).await.unwrap();
        let rows = store.query_unuploaded(10).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.row_id).collect();

        store.mark_uploaded(ids.clone()).await.unwrap();
        store.mark_uploaded(ids).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_resets_policy_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
        let policy = CheckpointPolicy {
            max_age: Duration::from_secs(0),
            max_size_bytes: u64::MAX,
        };
        let mut state = CheckpointState::default();

        let did_checkpoint = store.checkpoint_if_needed(&policy, &mut state).await.unwrap();
        assert!(did_checkpoint);
    }
}
