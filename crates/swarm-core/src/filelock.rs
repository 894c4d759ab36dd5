//! File-lock manager (spec §4.F): mutual exclusion over paths or glob
//! patterns, with stale recovery and glob-aware conflict detection.
//! Grounded on `examples/original_source/src/claudeswarm/locking.py`.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store::atomic_write;

pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub agent_id: String,
    pub filepath: String,
    pub locked_at: i64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Conflict {
    pub holder: String,
    pub age_secs: i64,
    pub reason: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn lock_file_path(root: &Path, filepath: &str) -> std::path::PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(filepath.as_bytes());
    let digest = hasher.finalize();
    paths::locks_dir(root).join(format!("{:x}.lock", digest))
}

fn ensure_locks_dir(root: &Path) -> Result<()> {
    let dir = paths::locks_dir(root);
    fs::create_dir_all(&dir).map_err(|e| SwarmError::Io {
        path: dir.clone(),
        source: e,
    })?;
    set_mode_0700(&dir);
    Ok(())
}

#[cfg(unix)]
fn set_mode_0700(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
}
#[cfg(not(unix))]
fn set_mode_0700(_path: &Path) {}

#[cfg(unix)]
fn set_mode_0600(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}
#[cfg(not(unix))]
fn set_mode_0600(_path: &Path) {}

fn load_record(path: &Path) -> Option<LockRecord> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn is_stale(record: &LockRecord, stale_timeout: Duration) -> bool {
    let age = now_unix() - record.locked_at;
    age < 0 || age as u64 > stale_timeout.as_secs()
}

fn path_conflicts(requested: &str, existing: &str) -> bool {
    if requested == existing {
        return true;
    }
    if let Ok(p) = Pattern::new(existing) {
        if p.matches(requested) {
            return true;
        }
    }
    if let Ok(p) = Pattern::new(requested) {
        if p.matches(existing) {
            return true;
        }
    }
    false
}

fn all_lock_files(root: &Path) -> Vec<std::path::PathBuf> {
    let dir = paths::locks_dir(root);
    fs::read_dir(&dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("lock"))
                .collect()
        })
        .unwrap_or_default()
}

/// Acquire a lock on `filepath` (a literal path or glob pattern) for
/// `agent_id`. Transparently evicts any stale lock it observes along the
/// way. Re-acquiring an already-held lock refreshes `locked_at`/`reason`
/// in place.
pub fn acquire(
    root: &Path,
    filepath: &str,
    agent_id: &str,
    reason: &str,
    stale_timeout: Duration,
) -> Result<(bool, Option<Conflict>)> {
    ensure_locks_dir(root)?;

    for candidate in all_lock_files(root) {
        let Some(record) = load_record(&candidate) else {
            let _ = fs::remove_file(&candidate);
            continue;
        };
        if is_stale(&record, stale_timeout) {
            let _ = fs::remove_file(&candidate);
            continue;
        }
        if !path_conflicts(filepath, &record.filepath) {
            continue;
        }
        if record.filepath == filepath && record.agent_id == agent_id {
            // Refresh in place: write-temp-then-rename, never delete first.
            let refreshed = LockRecord {
                agent_id: agent_id.to_string(),
                filepath: filepath.to_string(),
                locked_at: now_unix(),
                reason: reason.to_string(),
            };
            let bytes = serde_json::to_vec_pretty(&refreshed).map_err(|e| SwarmError::Json {
                path: candidate.clone(),
                source: e,
            })?;
            atomic_write(&candidate, &bytes)?;
            set_mode_0600(&candidate);
            return Ok((true, None));
        }
        return Ok((
            false,
            Some(Conflict {
                holder: record.agent_id,
                age_secs: now_unix() - record.locked_at,
                reason: record.reason,
            }),
        ));
    }

    // No conflict observed; create exclusively to close the race window.
    let lock_path = lock_file_path(root, filepath);
    let record = LockRecord {
        agent_id: agent_id.to_string(),
        filepath: filepath.to_string(),
        locked_at: now_unix(),
        reason: reason.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&record).map_err(|e| SwarmError::Json {
        path: lock_path.clone(),
        source: e,
    })?;

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut f) => {
            f.write_all(&bytes).map_err(|e| SwarmError::Io {
                path: lock_path.clone(),
                source: e,
            })?;
            set_mode_0600(&lock_path);
            Ok((true, None))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Race lost: report the actual holder.
            match load_record(&lock_path) {
                Some(holder) => Ok((
                    false,
                    Some(Conflict {
                        holder: holder.agent_id,
                        age_secs: now_unix() - holder.locked_at,
                        reason: holder.reason,
                    }),
                )),
                None => Ok((
                    false,
                    Some(Conflict {
                        holder: "unknown".to_string(),
                        age_secs: 0,
                        reason: String::new(),
                    }),
                )),
            }
        }
        Err(e) => Err(SwarmError::Io {
            path: lock_path,
            source: e,
        }),
    }
}

/// Release `filepath`'s lock held by `agent_id`. Idempotent: releasing a
/// non-existent or already-released lock returns `Ok(true)`.
pub fn release(root: &Path, filepath: &str, agent_id: &str) -> Result<bool> {
    let lock_path = lock_file_path(root, filepath);
    match load_record(&lock_path) {
        Some(record) if record.agent_id == agent_id => {
            let _ = fs::remove_file(&lock_path);
            Ok(true)
        }
        Some(_) => Ok(false),
        None => Ok(true),
    }
}

/// Who currently holds `filepath`'s lock, if any (transparently evicting a
/// stale lock file it observes).
pub fn who_has(root: &Path, filepath: &str, stale_timeout: Duration) -> Result<Option<LockRecord>> {
    let lock_path = lock_file_path(root, filepath);
    let Some(record) = load_record(&lock_path) else {
        return Ok(None);
    };
    if is_stale(&record, stale_timeout) {
        let _ = fs::remove_file(&lock_path);
        return Ok(None);
    }
    Ok(Some(record))
}

/// List every lock currently on disk. Stale locks observed are deleted;
/// pass `include_stale` to still see them in the returned snapshot.
pub fn list_all(root: &Path, include_stale: bool, stale_timeout: Duration) -> Result<Vec<LockRecord>> {
    let mut out = Vec::new();
    for candidate in all_lock_files(root) {
        let Some(record) = load_record(&candidate) else {
            let _ = fs::remove_file(&candidate);
            continue;
        };
        if is_stale(&record, stale_timeout) {
            let _ = fs::remove_file(&candidate);
            if include_stale {
                out.push(record);
            }
            continue;
        }
        out.push(record);
    }
    Ok(out)
}

/// Delete every stale lock file and report how many were removed.
pub fn cleanup_stale(root: &Path, stale_timeout: Duration) -> Result<usize> {
    let mut n = 0;
    for candidate in all_lock_files(root) {
        let Some(record) = load_record(&candidate) else {
            let _ = fs::remove_file(&candidate);
            n += 1;
            continue;
        };
        if is_stale(&record, stale_timeout) {
            let _ = fs::remove_file(&candidate);
            n += 1;
        }
    }
    Ok(n)
}

/// Delete every lock held by `agent_id`, regardless of staleness.
pub fn cleanup_agent(root: &Path, agent_id: &str) -> Result<usize> {
    let mut n = 0;
    for candidate in all_lock_files(root) {
        if let Some(record) = load_record(&candidate) {
            if record.agent_id == agent_id {
                let _ = fs::remove_file(&candidate);
                n += 1;
            }
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const T: Duration = Duration::from_secs(300);

    #[test]
    fn basic_acquire_conflict_release_cycle() {
        let tmp = TempDir::new().unwrap();
        let (ok, conflict) = acquire(
            tmp.path(),
            "src/auth/authentication.py",
            "agent-1",
            "Implementing user authentication",
            T,
        )
        .unwrap();
        assert!(ok);
        assert!(conflict.is_none());

        let (ok, conflict) = acquire(
            tmp.path(),
            "src/auth/authentication.py",
            "agent-2",
            "also working",
            T,
        )
        .unwrap();
        assert!(!ok);
        let conflict = conflict.unwrap();
        assert_eq!(conflict.holder, "agent-1");

        assert!(release(tmp.path(), "src/auth/authentication.py", "agent-1").unwrap());

        let (ok, _) = acquire(
            tmp.path(),
            "src/auth/authentication.py",
            "agent-2",
            "fix",
            T,
        )
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn glob_conflicts_with_literal_both_directions() {
        let tmp = TempDir::new().unwrap();
        let (ok, _) = acquire(tmp.path(), "src/auth/*.py", "agent-0", "refactor", T).unwrap();
        assert!(ok);

        let (ok, conflict) = acquire(tmp.path(), "src/auth/login.py", "agent-1", "fix", T).unwrap();
        assert!(!ok);
        assert_eq!(conflict.unwrap().holder, "agent-0");
    }

    #[test]
    fn stale_lock_recovered() {
        let tmp = TempDir::new().unwrap();
        acquire(tmp.path(), "src/critical_file.py", "agent-7", "work", T).unwrap();

        // Force the lock to look old by rewriting it directly.
        let lock_path = lock_file_path(tmp.path(), "src/critical_file.py");
        let mut record = load_record(&lock_path).unwrap();
        record.locked_at -= (T.as_secs() + 10) as i64;
        let bytes = serde_json::to_vec(&record).unwrap();
        fs::write(&lock_path, bytes).unwrap();

        let (ok, conflict) = acquire(tmp.path(), "src/critical_file.py", "agent-3", "take", T).unwrap();
        assert!(ok);
        assert!(conflict.is_none());

        let all = list_all(tmp.path(), false, T).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].agent_id, "agent-3");
    }

    #[test]
    fn release_of_missing_lock_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        assert!(release(tmp.path(), "nope.py", "agent-1").unwrap());
    }

    #[test]
    fn reacquire_by_same_agent_refreshes_without_conflict() {
        let tmp = TempDir::new().unwrap();
        acquire(tmp.path(), "f.py", "agent-1", "first", T).unwrap();
        let (ok, conflict) = acquire(tmp.path(), "f.py", "agent-1", "second", T).unwrap();
        assert!(ok);
        assert!(conflict.is_none());
        let holder = who_has(tmp.path(), "f.py", T).unwrap().unwrap();
        assert_eq!(holder.reason, "second");
    }

    #[test]
    fn cleanup_agent_removes_only_its_locks() {
        let tmp = TempDir::new().unwrap();
        acquire(tmp.path(), "a.py", "agent-1", "x", T).unwrap();
        acquire(tmp.path(), "b.py", "agent-2", "x", T).unwrap();
        let n = cleanup_agent(tmp.path(), "agent-1").unwrap();
        assert_eq!(n, 1);
        assert!(who_has(tmp.path(), "a.py", T).unwrap().is_none());
        assert!(who_has(tmp.path(), "b.py", T).unwrap().is_some());
    }
}
