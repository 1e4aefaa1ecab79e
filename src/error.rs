//! Typed error taxonomy for the store's public contract.
//!
//! Only the operations enumerated by the store contract (`json_io`, `lock`,
//! `backend`, `migrate`, `selector`) return `StateError`. Everything below
//! that surface keeps using `anyhow::Result` the way the rest of this crate
//! always has — `StateError` exists so call sites outside the crate can
//! match on failure category, not to replace internal context chains.
//!
//! *Absent* is deliberately not a variant here: a missing key is represented
//! in the type system as `None`, never as an error.

use thiserror::Error;

/// Failure categories a caller of the store contract can observe.
#[derive(Debug, Error)]
pub enum StateError {
    /// Strict JSON parse failed on a path that does not tolerate healing.
    #[error("corrupt document at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// `OPENCLAW_DATASTORE` held a value other than fs/filesystem/db/database/unset.
    #[error("invalid OPENCLAW_DATASTORE value: {0:?}")]
    InvalidConfig(String),

    /// Database backend selected without `OPENCLAW_STATE_DB_URL`.
    #[error("database backend selected but OPENCLAW_STATE_DB_URL is not set")]
    Misconfigured,

    /// The file lock could not be acquired within the retry budget.
    #[error("lock timeout on {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    /// A database query or transaction failed.
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// At least one file or row failed during a migration pass; the
    /// sentinel/marker was intentionally left unwritten.
    #[error("migration partial failure: {migrated}/{total} succeeded, {failed} failed")]
    MigrationPartialFailure {
        migrated: usize,
        total: usize,
        failed: usize,
    },

    /// Low-level I/O failure not otherwise categorized.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;
