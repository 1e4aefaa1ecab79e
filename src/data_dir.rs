//! `~/.openclaw/` state directory management.
//!
//! Locates, creates, and manages the root of the filesystem backend (§6).
//! The filesystem backend itself is built on top of this module; other
//! callers can use it to resolve where a given storage key should land on
//! disk without going through a backend instance.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Default state directory name under the user's home.
const STATE_DIR_NAME: &str = ".openclaw";

/// Environment variable to override the state directory location.
const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";

/// Test/operator seam for the home directory used in key normalization
/// (§4.A); not itself a state-dir override.
const HOME_ENV_OVERRIDE: &str = "OPENCLAW_HOME";

/// Get the state directory path.
/// Respects `OPENCLAW_STATE_DIR`, otherwise defaults to `~/.openclaw/`.
pub fn state_dir() -> PathBuf {
    if let Ok(override_path) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(override_path);
    }
    home_dir().join(STATE_DIR_NAME)
}

/// Get the home directory used for key normalization (§4.A).
///
/// Respects `OPENCLAW_HOME` (test seam), otherwise the platform home
/// directory, falling back to a fixed path if neither is available.
pub fn home_dir() -> PathBuf {
    if let Ok(override_home) = std::env::var(HOME_ENV_OVERRIDE) {
        return PathBuf::from(override_home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp/openclaw-fallback"))
}

/// Ensure the state directory exists, creating it (mode `0o700` on unix) if
/// needed. Returns the path to the directory.
pub fn ensure_state_dir() -> Result<PathBuf> {
    let dir = state_dir();
    ensure_dir_0700(&dir)?;
    Ok(dir)
}

/// Create `dir` (and parents) with mode `0o700` if it doesn't already exist.
/// Used by every write path that may need to materialize a new directory.
pub fn ensure_dir_0700(dir: &std::path::Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory at {}", dir.display()))?;
    set_mode_0700(dir);
    Ok(())
}

#[cfg(unix)]
fn set_mode_0700(dir: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(dir) {
        let mut perms = meta.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(dir, perms);
    }
}

#[cfg(not(unix))]
fn set_mode_0700(_dir: &std::path::Path) {}
