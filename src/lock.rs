//! Cross-process file locking with bounded exponential backoff (§4.C).
//!
//! Uses `O_CREAT | O_EXCL` semantics for atomic lock creation, the same
//! primitive the teacher crate's lockfile used. A lock file older than
//! `STALE_AFTER` is considered abandoned and may be broken by a later
//! acquirer; the PID recorded inside is also checked as a cheap, immediate
//! signal on unix (a dead PID is stale regardless of age).
//!
//! `LockGuard` is RAII: the lock file is removed on drop, including on the
//! unwind path through a panic inside the locked body.

use crate::error::StateError;
use anyhow::{Context, Result};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Bounded retry budget (§4.C).
pub const MAX_RETRIES: u32 = 10;
/// Exponential backoff floor.
pub const BACKOFF_MIN: Duration = Duration::from_millis(100);
/// Exponential backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Backoff growth factor.
pub const BACKOFF_FACTOR: u32 = 2;
/// A lock held longer than this is considered stale.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// RAII guard that releases the lock file on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl LockGuard {
    /// Get the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquire an exclusive lock at `lock_path`, retrying with exponential
/// backoff and jitter up to `MAX_RETRIES` times before giving up.
///
/// A lock file is considered stale (and is broken before the next attempt)
/// when either its recorded PID is no longer alive, or it is older than
/// `STALE_AFTER` — the latter covers lock files written by a process on a
/// different host, where PID liveness can't be checked at all.
pub fn acquire(lock_path: &Path) -> Result<LockGuard, StateError> {
    if let Some(parent) = lock_path.parent() {
        crate::data_dir::ensure_dir_0700(parent)
            .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    }

    let mut backoff = BACKOFF_MIN;
    for attempt in 0..=MAX_RETRIES {
        match try_create_lock(lock_path) {
            Ok(guard) => return Ok(guard),
            Err(_) if attempt < MAX_RETRIES => {
                if is_stale(lock_path) {
                    tracing::warn!(path = %lock_path.display(), "breaking stale lock");
                    let _ = fs::remove_file(lock_path);
                    continue;
                }
                tracing::debug!(
                    path = %lock_path.display(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "lock held, retrying after backoff"
                );
                std::thread::sleep(jittered(backoff));
                backoff = (backoff * BACKOFF_FACTOR).min(BACKOFF_MAX);
            }
            Err(_) => break,
        }
    }

    Err(StateError::LockTimeout {
        path: lock_path.display().to_string(),
        attempts: MAX_RETRIES + 1,
    })
}

fn jittered(base: Duration) -> Duration {
    let jitter_frac: f64 = rand::rng().random_range(0.0..0.25);
    base + Duration::from_secs_f64(base.as_secs_f64() * jitter_frac)
}

/// Try to create the lock file atomically.
fn try_create_lock(lock_path: &Path) -> Result<LockGuard> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true) // O_CREAT | O_EXCL
        .open(lock_path)
        .with_context(|| format!("lock file already exists: {}", lock_path.display()))?;

    let pid = std::process::id();
    writeln!(file, "{pid}")
        .with_context(|| format!("failed to write pid to lock file: {}", lock_path.display()))?;

    Ok(LockGuard {
        path: lock_path.to_path_buf(),
    })
}

/// Check if a lock file is stale: dead PID, or older than `STALE_AFTER`.
pub fn is_stale(lock_path: &Path) -> bool {
    let Ok(meta) = fs::metadata(lock_path) else {
        return false;
    };
    if let Ok(modified) = meta.modified() {
        if let Ok(age) = SystemTime::now().duration_since(modified) {
            if age > STALE_AFTER {
                return true;
            }
        }
    }
    match read_lock_pid(lock_path) {
        Some(pid) => !is_process_alive(pid),
        None => false,
    }
}

fn read_lock_pid(lock_path: &Path) -> Option<u32> {
    let content = fs::read_to_string(lock_path).ok()?;
    content.trim().parse().ok()
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) checks if process exists without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Acquire the lock at `lock_path`, run `body`, and release on every exit
/// path (including a panic unwinding through `body`).
pub fn with_lock<T>(
    lock_path: &Path,
    body: impl FnOnce() -> Result<T, StateError>,
) -> Result<T, StateError> {
    let _guard = acquire(lock_path)?;
    body()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("test.lock");

        {
            let guard = acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
            assert_eq!(guard.path(), lock_path);

            let content = fs::read_to_string(&lock_path).unwrap();
            let pid: u32 = content.trim().parse().unwrap();
            assert_eq!(pid, std::process::id());
        }

        assert!(!lock_path.exists());
    }

    #[test]
    fn test_stale_lock_by_dead_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("stale.lock");

        fs::write(&lock_path, "999999999\n").unwrap();
        assert!(is_stale(&lock_path));

        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();
        assert!(!is_stale(&lock_path));
    }

    #[test]
    fn test_stale_lock_by_age() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("aged.lock");
        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();

        // Live PID, but backdate the mtime well past STALE_AFTER: age alone
        // must be enough to condemn a lock from a host we can't probe.
        let backdated = SystemTime::now() - Duration::from_secs(60);
        let file = File::open(&lock_path).unwrap();
        let times = fs::FileTimes::new().set_modified(backdated);
        file.set_times(times).unwrap();

        assert!(is_stale(&lock_path));
    }

    #[test]
    fn test_fresh_lock_with_live_pid_not_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("fresh.lock");
        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();
        assert!(!is_stale(&lock_path));
    }

    #[test]
    fn test_acquire_recovers_stale_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("stale.lock");

        fs::write(&lock_path, "999999999\n").unwrap();

        let guard = acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_with_lock_runs_body_and_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("body.lock");

        let result = with_lock(&lock_path, || Ok::<_, StateError>(42));
        assert_eq!(result.unwrap(), 42);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("err.lock");

        let result: Result<(), StateError> = with_lock(&lock_path, || Err(StateError::Misconfigured));
        assert!(result.is_err());
        assert!(!lock_path.exists());
    }
}
