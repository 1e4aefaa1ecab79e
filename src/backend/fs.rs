//! Filesystem backend (§4.D).
//!
//! The normalized storage key *is* a relative (or absolute) filesystem
//! path, resolved under the state directory root. Every operation here is
//! synchronous disk I/O; the `async` shape of the write/update methods on
//! [`StateBackend`] exists only so the trait is uniform with
//! [`super::db::DbBackend`] — nothing in this file ever actually suspends.

use super::{FallbackRead, StateBackend, UpdateOutcome};
use crate::error::StateError;
use crate::{key, lock, store};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Store contract implementation rooted at a state directory (§6).
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Build a backend rooted at `root`, creating it (mode `0o700`) if
    /// it doesn't yet exist.
    pub fn new(root: PathBuf) -> Result<Self, StateError> {
        crate::data_dir::ensure_dir_0700(&root)
            .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Self { root })
    }

    /// Resolve a storage key to its absolute path under this backend's root.
    ///
    /// A key that is already absolute (came from outside the home
    /// directory at normalization time, §4.A) is used verbatim rather than
    /// joined under `root`, mirroring `key::materialize`.
    pub fn resolve(&self, key: &str) -> PathBuf {
        if Path::new(key).is_absolute() {
            PathBuf::from(key)
        } else {
            self.root.join(key)
        }
    }

    fn lock_path(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!("{file_name}.lock"))
    }

    /// The root this backend is rooted at; used by the migrator (§4.H) to
    /// enumerate `*.json` files and by `key::normalize` callers.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StateBackend for FsBackend {
    fn read_json(&self, key: &str) -> Result<Option<Value>, StateError> {
        store::load_json(&self.resolve(key))
    }

    fn read_json5(&self, key: &str) -> Result<Option<Value>, StateError> {
        store::load_json_lenient(&self.resolve(key))
    }

    fn read_text(&self, key: &str) -> Result<Option<String>, StateError> {
        let path = self.resolve(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&path)?))
    }

    async fn write_json(&self, key: &str, document: Value) -> Result<(), StateError> {
        store::save_json(&self.resolve(key), &document)
    }

    async fn write_json_with_backup(&self, key: &str, document: Value) -> Result<(), StateError> {
        store::save_json_with_backup(&self.resolve(key), &document)
    }

    async fn write_text(&self, key: &str, content: String) -> Result<(), StateError> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            crate::data_dir::ensure_dir_0700(parent)
                .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        std::fs::write(&path, content)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        store::delete(&self.resolve(key))
    }

    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: Box<dyn FnOnce(Option<Value>) -> Result<UpdateOutcome, StateError> + Send>,
    ) -> Result<Value, StateError> {
        let path = self.resolve(key);
        let lock_path = self.lock_path(&path);
        // Lock acquisition retries with `std::thread::sleep` backoff (§4.C)
        // and can block for real wall-clock time under contention; run it
        // on the blocking pool so it doesn't stall the worker thread this
        // `async fn` was polled on (§5: `updateJsonWithLock` is suspending).
        tokio::task::spawn_blocking(move || {
            lock::with_lock(&lock_path, || {
                let current = store::load_json(&path)?;
                let outcome = updater(current)?;
                if outcome.changed {
                    store::save_json(&path, &outcome.result)?;
                }
                Ok(outcome.result)
            })
        })
        .await
        .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn flush(&self) -> Result<(), StateError> {
        Ok(())
    }
}
