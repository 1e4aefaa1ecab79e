//! Backend selector / process-wide singleton (§4.G).
//!
//! `init()` is the crate's single startup entry point: it resolves which
//! backend `OPENCLAW_DATASTORE` names, runs whichever migration direction
//! that implies (§4.H), and installs the result as the process-wide
//! instance returned by [`get`]. Call sites never construct a backend
//! themselves.

use crate::backend::db::DbBackend;
use crate::backend::fs::FsBackend;
use crate::backend::StateBackend;
use crate::error::StateError;
use crate::{data_dir, migrate};
use std::sync::{Arc, RwLock};

const DATASTORE_ENV: &str = "OPENCLAW_DATASTORE";
const DB_URL_ENV: &str = "OPENCLAW_STATE_DB_URL";

/// Which backend `OPENCLAW_DATASTORE` names (§4.G, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    Database,
}

static INSTANCE: RwLock<Option<Arc<dyn StateBackend>>> = RwLock::new(None);

/// Parse `OPENCLAW_DATASTORE` (§4.G). Unset defaults to filesystem — a
/// deliberately safe default even when a DB URL happens to be present, so
/// selecting the database backend is always an explicit opt-in, never a
/// silent fall-through.
pub fn resolve_backend_kind() -> Result<BackendKind, StateError> {
    match std::env::var(DATASTORE_ENV) {
        Err(_) => Ok(BackendKind::Filesystem),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(BackendKind::Filesystem),
            "fs" | "filesystem" => Ok(BackendKind::Filesystem),
            "db" | "database" => Ok(BackendKind::Database),
            other => Err(StateError::InvalidConfig(other.to_string())),
        },
    }
}

/// Orchestrate startup (§4.G `init`): resolve the backend, run the
/// migration direction it implies, and install the process-wide instance.
///
/// For the database backend this also calls [`DbBackend::ensure_preloaded`]
/// so the instance installed here already serves synchronous reads.
pub async fn init() -> Result<(), StateError> {
    let kind = resolve_backend_kind()?;
    let home = data_dir::home_dir().to_string_lossy().to_string();
    let state_dir = data_dir::state_dir();

    let backend: Arc<dyn StateBackend> = match kind {
        BackendKind::Filesystem => {
            let fs = FsBackend::new(state_dir)?;
            if let Ok(db_url) = std::env::var(DB_URL_ENV) {
                if !db_url.trim().is_empty() {
                    match DbBackend::connect(db_url.trim()).await {
                        Ok(db) => {
                            if let Err(e) = migrate::migrate_db_to_fs(&fs, &db, &home).await {
                                tracing::warn!(error = %e, "db->fs migration pass failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "could not reach configured database for db->fs migration; continuing on filesystem alone");
                        }
                    }
                }
            }
            Arc::new(fs)
        }
        BackendKind::Database => {
            let db_url = std::env::var(DB_URL_ENV).map_err(|_| StateError::Misconfigured)?;
            if db_url.trim().is_empty() {
                return Err(StateError::Misconfigured);
            }
            let db = DbBackend::connect(db_url.trim()).await?;
            let fs = FsBackend::new(state_dir)?;
            migrate::migrate_fs_to_db(&fs, &db, &home).await?;
            db.ensure_preloaded().await?;
            Arc::new(db)
        }
    };

    tracing::info!(?kind, "state backend initialized");
    *INSTANCE.write().unwrap() = Some(backend);
    Ok(())
}

/// The process-wide backend installed by the last successful [`init`] (or
/// [`set_for_test`]).
///
/// # Panics
/// Panics if neither `init()` nor `set_for_test()` has run yet — a missing
/// backend is a startup-ordering bug in the embedding process, not a
/// recoverable runtime condition.
pub fn get() -> Arc<dyn StateBackend> {
    INSTANCE
        .read()
        .unwrap()
        .clone()
        .expect("state backend not initialized; call init() before using the store")
}

/// Test-only seam: install an alternate instance without going through
/// `init()`'s environment-variable resolution or migration passes.
pub fn set_for_test(backend: Arc<dyn StateBackend>) {
    *INSTANCE.write().unwrap() = Some(backend);
}

/// Durability barrier (§5, §8 invariant 8) for the process-wide instance.
pub async fn flush() -> Result<(), StateError> {
    get().flush().await
}
