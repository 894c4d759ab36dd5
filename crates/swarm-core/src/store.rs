//! Concurrency-safe JSON state store (spec §4.B) — the shared invariant
//! behind every other component: atomic, locked reads/writes of JSON files
//! under the project root, with optimistic-concurrency versioning for
//! collections (like pending acks) whose read-modify-write window spans
//! I/O outside the lock.
//!
//! Grounded on the teacher's `io/lock.rs` (fs2 advisory locking with
//! backoff) and `io/atomic.rs` (write-temp-then-rename), generalized from
//! a single-purpose inbox writer into the generic read/write helpers every
//! collection file in this crate is built on.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[cfg(unix)]
fn file_identity(file: &File) -> Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = file.metadata().map_err(|e| SwarmError::Io {
        path: PathBuf::new(),
        source: e,
    })?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(file: &File) -> Result<(u64, u64)> {
    let meta = file.metadata().map_err(|e| SwarmError::Io {
        path: PathBuf::new(),
        source: e,
    })?;
    Ok((meta.len(), 0))
}

/// An open, advisory-locked handle on a state file. Released on drop.
pub struct LockedFile {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockedFile {
    /// Acquire a shared or exclusive advisory lock on `path`, creating the
    /// file (mode 0600) and its parent directory if needed. Retries until
    /// `timeout` elapses, then fails with [`SwarmError::LockTimeout`].
    /// After acquiring, verifies the file wasn't replaced mid-wait
    /// (device+inode identity check) — a detected replacement surfaces as
    /// [`SwarmError::LockIntegrity`].
    pub fn acquire(path: &Path, exclusive: bool, timeout: Duration) -> Result<Self> {
        ensure_state_file(path)?;

        let pre_identity = {
            let f = OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|e| SwarmError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            file_identity(&f)?
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SwarmError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                file.try_lock_exclusive()
            } else {
                file.try_lock_shared()
            };
            match attempt {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(SwarmError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(SwarmError::Io {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        let post_identity = file_identity(&file)?;
        if pre_identity != post_identity {
            let _ = FileExt::unlock(&file);
            return Err(SwarmError::LockIntegrity {
                path: path.to_path_buf(),
            });
        }

        Ok(LockedFile {
            file,
            path: path.to_path_buf(),
            exclusive,
        })
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| SwarmError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Write `bytes` atomically (temp file + rename), replacing the locked
    /// target. Only valid while holding an exclusive lock.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.exclusive, "write_bytes requires an exclusive lock");
        atomic_write(&self.path, bytes)
    }
}

fn ensure_state_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SwarmError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
        set_mode_0600(parent);
    }
    if !path.exists() {
        fs::write(path, b"").map_err(|e| SwarmError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        set_mode_0600(path);
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode_0600(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_mode_0600(_path: &Path) {}

/// Write `bytes` to a sibling `.tmp` file, then rename over `path`. Removes
/// the temp file on error.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    let write_result = (|| -> Result<()> {
        let mut tmp = File::create(&tmp_path).map_err(|e| SwarmError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        tmp.write_all(bytes).map_err(|e| SwarmError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        set_mode_0600(&tmp_path);
        Ok(())
    })();
    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        SwarmError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Read `path` under a shared lock and deserialize; missing file or corrupt
/// JSON is treated as the type's default (a warning is logged for corrupt
/// content).
pub fn read_locked<T: DeserializeOwned + Default>(
    path: &Path,
    timeout: Duration,
) -> Result<T> {
    let guard = LockedFile::acquire(path, false, timeout)?;
    let bytes = guard.read_bytes()?;
    Ok(parse_or_default(path, &bytes))
}

fn parse_or_default<T: DeserializeOwned + Default>(path: &Path, bytes: &[u8]) -> T {
    if bytes.is_empty() {
        return T::default();
    }
    match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt state file, treating as empty");
            T::default()
        }
    }
}

/// Read-modify-write `path` under a single exclusive lock held for the
/// entire window: read current value (or default), call `mutate`, write
/// the result back atomically. Returns the new value.
pub fn write_locked<T, F>(path: &Path, timeout: Duration, mutate: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(T) -> Result<T>,
{
    let guard = LockedFile::acquire(path, true, timeout)?;
    let bytes = guard.read_bytes()?;
    let current: T = parse_or_default(path, &bytes);
    let updated = mutate(current)?;
    let serialized = serde_json::to_vec_pretty(&updated).map_err(|e| SwarmError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    guard.write_bytes(&serialized)?;
    Ok(updated)
}

/// Read the embedded integer `"version"` field of a JSON document (0 if
/// absent, missing, or the file is corrupt/empty) alongside the full
/// deserialized value. Used for optimistic-concurrency collections whose
/// writers perform I/O outside the lock (the ack/retry engine).
pub fn read_versioned<T: DeserializeOwned + Default>(
    path: &Path,
    timeout: Duration,
) -> Result<(T, u64)> {
    let guard = LockedFile::acquire(path, false, timeout)?;
    let bytes = guard.read_bytes()?;
    let version = extract_version(&bytes);
    let value: T = parse_or_default(path, &bytes);
    Ok((value, version))
}

fn extract_version(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("version").and_then(|v| v.as_u64()))
        .unwrap_or(0)
}

/// Compare-and-swap write: under an exclusive lock, fail with
/// [`SwarmError::Conflict`] if the on-disk version isn't `expected_version`;
/// otherwise serialize `value` (which must carry `"version": expected_version + 1`)
/// and write it atomically. Callers retry a bounded number of times on
/// conflict (§4.H uses this for `PENDING_ACKS.json`).
pub fn write_versioned_cas<T: Serialize>(
    path: &Path,
    timeout: Duration,
    expected_version: u64,
    value: &T,
) -> Result<()> {
    let guard = LockedFile::acquire(path, true, timeout)?;
    let bytes = guard.read_bytes()?;
    let current_version = extract_version(&bytes);
    if current_version != expected_version {
        return Err(SwarmError::Conflict(format!(
            "version mismatch on {}: expected {expected_version}, found {current_version}",
            path.display()
        )));
    }
    let serialized = serde_json::to_vec_pretty(value).map_err(|e| SwarmError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    guard.write_bytes(&serialized)
}
