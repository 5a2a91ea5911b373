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

//! Storage path normalization and the single-instance advisory file lock
//! (spec.md §4.7, §6).

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;

/// All the errors that can occur while acquiring the instance lock.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred while preparing or writing the lock file.
    #[error("I/O error on lock file {path}: {source}")]
    Io {
        /// The lock file path involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// Another process already holds the lock.
    #[error("lock file {path} is held by another instance")]
    Contended {
        /// The lock file path that is already held.
        path: PathBuf,
    },
}

/// Strips an optional `?query` suffix from a raw storage path.
fn strip_query(raw: &str) -> &str {
    match raw.find('?') {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

/// Normalizes a configured storage path into the forms accepted by
/// spec.md §6: absolute path, relative path (resolved against the process
/// working directory), `file:/abs`, `file:///abs`, or `file://host/share/...`
/// (UNC, preserved), with any `?query` suffix stripped.
pub fn normalize_storage_path(raw: &str) -> PathBuf {
    let raw = strip_query(raw);

    if let Some(rest) = raw.strip_prefix("file://") {
        return if let Some(abs) = rest.strip_prefix('/') {
            PathBuf::from(format!("/{abs}"))
        } else if rest.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(format!("//{rest}"))
        };
    }

    if let Some(rest) = raw.strip_prefix("file:") {
        return PathBuf::from(rest);
    }

    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

/// Derives the lock file path from a normalized storage path: the
/// normalized path with `.lock` appended (spec.md §4.7).
pub fn lock_path_for(normalized: &Path) -> PathBuf {
    let mut os_string = normalized.as_os_str().to_owned();
    os_string.push(".lock");
    PathBuf::from(os_string)
}

/// A held single-instance advisory lock. The backing file is never deleted
/// on release — deletion would open an inode race where two successive
/// instances lock different inodes and both believe they hold the lock
/// (spec.md §4.7).
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquires the instance lock bound to `storage_path`, writing the
    /// current process id in ASCII into the lock file. A stale PID left by
    /// a crashed, now-unlocked process is accepted and overwritten.
    pub fn acquire(storage_path: &str) -> Result<Self, Error> {
        let normalized = normalize_storage_path(storage_path);
        let path = lock_path_for(&normalized);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
        }

        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        file.try_lock_exclusive().map_err(|_| Error::Contended { path: path.clone() })?;

        file.set_len(0).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(0)).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        write!(file, "{}", std::process::id()).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        file.flush().map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), pid = std::process::id(), "acquired instance lock");
        Ok(Self { file, path })
    }

    /// The lock file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, path = %self.path.display(), "failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absolute_path_is_unchanged() {
        assert_eq!(normalize_storage_path("/var/lib/agent/queue.db"), PathBuf::from("/var/lib/agent/queue.db"));
    }

    #[test]
    fn relative_path_is_resolved_against_cwd() {
        let resolved = normalize_storage_path("queue.db");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("queue.db"));
    }

    #[test]
    fn file_single_slash_form_is_absolute() {
        assert_eq!(normalize_storage_path("file:/var/lib/agent/queue.db"), PathBuf::from("/var/lib/agent/queue.db"));
    }

    #[test]
    fn file_triple_slash_form_is_absolute() {
        assert_eq!(normalize_storage_path("file:///var/lib/agent/queue.db"), PathBuf::from("/var/lib/agent/queue.db"));
    }

    #[test]
    fn unc_form_is_preserved() {
        assert_eq!(normalize_storage_path("file://host/share/queue.db"), PathBuf::from("//host/share/queue.db"));
    }

    #[test]
    fn query_parameters_are_stripped() {
        assert_eq!(normalize_storage_path("/var/lib/agent/queue.db?mode=rwc"), PathBuf::from("/var/lib/agent/queue.db"));
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(lock_path_for(Path::new("/data/queue.db")), PathBuf::from("/data/queue.db.lock"));
    }

    #[test]
    fn second_acquire_on_the_same_path_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let storage_path = dir.path().join("queue.db");
        let storage_path = storage_path.to_str().unwrap();

        let first = InstanceLock::acquire(storage_path).unwrap();
        let pid_contents = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(pid_contents, std::process::id().to_string());

        let second = InstanceLock::acquire(storage_path);
        assert!(matches!(second, Err(Error::Contended { .. })));

        drop(first);
        assert!(first_path_still_exists(storage_path));
    }

    fn first_path_still_exists(storage_path: &str) -> bool {
        let normalized = normalize_storage_path(storage_path);
        lock_path_for(&normalized).exists()
    }
}
