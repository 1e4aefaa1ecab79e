//! The store contract shared by both backends (§4.D, §4.F, §4.I).
//!
//! Reads are plain synchronous methods on both backends: on the filesystem
//! backend they hit disk, on the database backend they hit the in-memory
//! cache. Writes and the locked update primitive are `async` because the
//! database backend's durability path genuinely suspends (§5); the
//! filesystem backend's implementations simply never await anything.

pub mod db;
pub mod fs;

use crate::error::StateError;
use async_trait::async_trait;
use serde_json::Value;

/// Result of a `read_json_with_fallback` call: distinguishes "the key was
/// absent, here is your fallback" from "the key held exactly this value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRead {
    pub value: Value,
    pub exists: bool,
}

/// Outcome an `updater` closure reports back to `update_json_with_lock`.
pub struct UpdateOutcome {
    pub changed: bool,
    pub result: Value,
}

impl UpdateOutcome {
    /// The updater examined `current` and decided nothing needs to change.
    pub fn unchanged(current: Value) -> Self {
        Self {
            changed: false,
            result: current,
        }
    }

    /// The updater produced a new value that must be persisted.
    pub fn changed(result: Value) -> Self {
        Self {
            changed: true,
            result,
        }
    }
}

/// The pluggable key-value store contract (§4.D / §4.F).
///
/// Implemented identically in meaning by [`fs::FsBackend`] and
/// [`db::DbBackend`]; callers write against this trait and never need to
/// know which backend is live.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Synchronous read. `None` means the key has never been written (or
    /// was deleted) — absence is not an error (§7).
    fn read_json(&self, key: &str) -> Result<Option<Value>, StateError>;

    /// Like `read_json`, but on a path that tolerates JSON5 for
    /// human-editable files. On the database backend this is identical to
    /// `read_json` — the DB always stores strict JSON.
    fn read_json5(&self, key: &str) -> Result<Option<Value>, StateError>;

    /// Read a plain-text value. On the filesystem backend this is the raw
    /// file contents; on the database backend it unwraps the `{__text}`
    /// marker object written by `write_text`.
    fn read_text(&self, key: &str) -> Result<Option<String>, StateError>;

    /// `read_json`, but distinguishing absence from a present value so a
    /// caller can tell "defaulted" from "explicitly equal to the default".
    fn read_json_with_fallback(&self, key: &str, fallback: Value) -> Result<FallbackRead, StateError> {
        match self.read_json(key)? {
            Some(value) => Ok(FallbackRead { value, exists: true }),
            None => Ok(FallbackRead {
                value: fallback,
                exists: false,
            }),
        }
    }

    /// Write `document` under `key`. On the filesystem backend this is
    /// synchronous disk I/O; on the database backend it returns once the
    /// cache has been updated, with the durable upsert still in flight
    /// (§5) — call `flush()` to wait for it.
    async fn write_json(&self, key: &str, document: Value) -> Result<(), StateError>;

    /// `write_json`, and best-effort maintain a `.bak`-style backup of the
    /// previous durable state. Identical to `write_json` on the database
    /// backend, which has no separate backup concept.
    async fn write_json_with_backup(&self, key: &str, document: Value) -> Result<(), StateError>;

    /// Write a plain string value.
    async fn write_text(&self, key: &str, content: String) -> Result<(), StateError>;

    /// Remove `key`. Absence is not an error.
    async fn delete(&self, key: &str) -> Result<(), StateError>;

    /// The update protocol (§4.I): `updater` observes a snapshot no
    /// concurrent update on the same key can have interleaved against, and
    /// its `UpdateOutcome` is persisted atomically before this call
    /// returns (or not at all, if `changed` is false or `updater` errors).
    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: Box<dyn FnOnce(Option<Value>) -> Result<UpdateOutcome, StateError> + Send>,
    ) -> Result<Value, StateError>;

    /// Durability barrier (§5, §8 invariant 8). A no-op on the filesystem
    /// backend, since its writes are already synchronous; on the database
    /// backend, waits for every write/delete issued before this call to
    /// commit.
    async fn flush(&self) -> Result<(), StateError>;
}
