//! File locking and atomic JSON documents
//!
//! Both file-backed stores (templates and occurrences) keep one JSON document
//! each. Every write follows the same pattern:
//!
//! 1. Acquire an exclusive `fs2` lock on `<path>.lock` (with timeout)
//! 2. Write the new document to a temp file next to the target
//! 3. Rename the temp file over the target
//! 4. Release the lock on drop
//!
//! Readers therefore never observe a half-written document, and two recur
//! processes sharing a data directory cannot interleave read-modify-write
//! cycles.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Retry interval while waiting for a contended lock
const LOCK_RETRY_INTERVAL_MS: u64 = 25;

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // Windows reports sharing violations instead of WouldBlock.
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Exclusive lock guard, released when dropped
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire an exclusive lock, waiting up to `timeout_ms`
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;
        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileLock { file }),
                Err(e) if is_lock_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_INTERVAL_MS));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Lock file guarding `path`
pub fn lock_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

/// Write `data` to `path` via temp file + rename. Does not lock.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Temp file must live in the same directory for the rename to be atomic.
    let temp_path = path.with_extension(format!(
        "{}.tmp.{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or(""),
        std::process::id()
    ));

    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(data)?;
    temp_file.sync_all()?;
    drop(temp_file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a JSON document, `None` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Read-modify-write a JSON document under its lock.
///
/// `f` sees the current document (or `T::default()` when missing). The
/// document is written back only when `f` returns `Ok`.
pub fn update_json_locked<T, R, F>(path: &Path, timeout_ms: u64, f: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<R>,
{
    let _lock = FileLock::acquire(lock_path_for(path), timeout_ms)?;
    let mut document: T = read_json(path)?.unwrap_or_default();
    let result = f(&mut document)?;
    let json = serde_json::to_vec_pretty(&document)?;
    write_atomic(path, &json)?;
    Ok(result)
}
