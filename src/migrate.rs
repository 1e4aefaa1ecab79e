//! Bidirectional migrator (§4.H): moves live state between backends at
//! startup, idempotently in either direction via a sentinel (DB) or marker
//! file (FS).

use crate::backend::db::DbBackend;
use crate::backend::fs::FsBackend;
use crate::backend::StateBackend;
use crate::error::StateError;
use crate::key;
use serde_json::{json, Value};
use sqlx::Row;
use std::path::Path;

/// Reserved DB key marking a completed filesystem → database upgrade.
pub const FS_TO_DB_SENTINEL: &str = "_migration/fs-to-db";
/// Marker file marking a completed database → filesystem downgrade.
pub const DB_TO_FS_MARKER: &str = ".migrated-from-db";

/// Directory basenames never walked when enumerating state files (§4.H).
const EXCLUDED_DIRS: &[&str] = &["workspace", "sessions", "media", "logs", "node_modules"];

#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub total: usize,
    pub failed: usize,
}

/// Filesystem → database upgrade. Idempotent: returns immediately if the
/// DB already carries [`FS_TO_DB_SENTINEL`].
pub async fn migrate_fs_to_db(
    fs: &FsBackend,
    db: &DbBackend,
    home: &str,
) -> Result<MigrationSummary, StateError> {
    if db.read_json(FS_TO_DB_SENTINEL)?.is_some() {
        return Ok(MigrationSummary::default());
    }
    // The sentinel may live only in the DB, not yet in the cache, if this
    // process hasn't preloaded — check the table directly too.
    if sentinel_row_exists(db, FS_TO_DB_SENTINEL).await? {
        return Ok(MigrationSummary::default());
    }

    let files = enumerate_json_files(fs.root());
    let total = files.len();
    let mut migrated = 0usize;
    let mut failed = 0usize;

    for path in files {
        match crate::store::load_json(&path) {
            Ok(Some(document)) => {
                let storage_key = key::normalize(&path.to_string_lossy(), home);
                match upsert_if_absent(db, &storage_key, &document).await {
                    Ok(()) => migrated += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "fs->db upsert failed");
                        failed += 1;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable/corrupt file during fs->db migration");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        let sentinel = json!({
            "migratedAt": chrono::Utc::now().to_rfc3339(),
            "count": migrated,
        });
        db.write_json(FS_TO_DB_SENTINEL, sentinel).await?;
        db.flush().await?;
    }

    tracing::info!(migrated, total, failed, "fs->db migration pass complete");
    Ok(MigrationSummary { migrated, total, failed })
}

/// Database → filesystem downgrade. Idempotent: returns immediately if
/// `<state_dir>/.migrated-from-db` already exists.
pub async fn migrate_db_to_fs(
    fs: &FsBackend,
    db: &DbBackend,
    home: &str,
) -> Result<MigrationSummary, StateError> {
    let marker_path = fs.root().join(DB_TO_FS_MARKER);
    if marker_path.exists() {
        return Ok(MigrationSummary::default());
    }

    let rows = sqlx::query("SELECT key, data FROM kv WHERE key NOT LIKE '_migration/%'")
        .fetch_all(db_pool(db))
        .await
        .map_err(|e| StateError::Transport(e.into()))?;

    let total = rows.len();
    let mut migrated = 0usize;
    let mut failed = 0usize;

    for row in rows {
        let storage_key: String = row.get("key");
        let data: Value = row.get("data");
        let target = key::materialize(&storage_key, home);
        if target.exists() {
            continue;
        }
        match crate::store::save_json(&target, &data) {
            Ok(()) => migrated += 1,
            Err(e) => {
                tracing::warn!(key = %storage_key, error = %e, "db->fs save failed");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        let marker = json!({
            "migratedAt": chrono::Utc::now().to_rfc3339(),
            "count": migrated,
        });
        crate::store::save_json(&marker_path, &marker)?;
    }

    tracing::info!(migrated, total, failed, "db->fs migration pass complete");
    Ok(MigrationSummary { migrated, total, failed })
}

/// `INSERT ... ON CONFLICT (key) DO NOTHING` so a pre-existing DB row from
/// a prior run, or a concurrently-booting process, is never overwritten.
async fn upsert_if_absent(db: &DbBackend, key: &str, document: &Value) -> Result<(), StateError> {
    sqlx::query("INSERT INTO kv (key, data, updated_at) VALUES ($1, $2, now()) ON CONFLICT (key) DO NOTHING")
        .bind(key)
        .bind(document)
        .execute(db_pool(db))
        .await
        .map_err(|e| StateError::Transport(e.into()))?;
    Ok(())
}

async fn sentinel_row_exists(db: &DbBackend, key: &str) -> Result<bool, StateError> {
    let row = sqlx::query("SELECT 1 AS present FROM kv WHERE key = $1")
        .bind(key)
        .fetch_optional(db_pool(db))
        .await
        .map_err(|e| StateError::Transport(e.into()))?;
    Ok(row.is_some())
}

fn db_pool(db: &DbBackend) -> &sqlx::PgPool {
    db.pool()
}

/// Recursively enumerate `*.json` files under `root`, skipping excluded
/// directories and non-`.json`/`.bak`/`.tmp`/`.lock` siblings (§4.H step 2).
fn enumerate_json_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    walk(root, &mut out);
    out
}

fn walk(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) || name.starts_with("workspace-") {
                continue;
            }
            walk(&path, out);
        } else if name.ends_with(".json") && !name.ends_with(".bak") {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enumerate_skips_excluded_dirs_and_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        std::fs::write(root.join("a.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("sessions")).unwrap();
        std::fs::write(root.join("sessions").join("b.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("workspace-foo")).unwrap();
        std::fs::write(root.join("workspace-foo").join("c.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("nested").join("d.json"), "{}").unwrap();
        std::fs::write(root.join("nested").join("d.json.bak"), "{}").unwrap();
        std::fs::write(root.join("nested").join("d.json.lock"), "x").unwrap();

        let mut files: Vec<_> = enumerate_json_files(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        files.sort();

        assert_eq!(
            files,
            vec![
                std::path::PathBuf::from("a.json"),
                std::path::PathBuf::from("nested/d.json"),
            ]
        );
    }

    fn test_db_url() -> Option<String> {
        std::env::var("OPENCLAW_TEST_DB_URL").ok()
    }

    #[tokio::test]
    async fn test_fs_to_db_migration_idempotent() {
        let Some(url) = test_db_url() else {
            eprintln!("skipping: OPENCLAW_TEST_DB_URL not set");
            return;
        };

        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let state_dir = home.join(".openclaw");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("a.json"), serde_json::to_string(&json!({"n": 1})).unwrap()).unwrap();
        std::fs::write(state_dir.join("b.json"), serde_json::to_string(&json!({"n": 2})).unwrap()).unwrap();

        let fs = FsBackend::new(state_dir.clone()).unwrap();
        let db = DbBackend::connect(&url).await.unwrap();
        sqlx::query("DELETE FROM kv").execute(db.pool()).await.unwrap();

        let home_str = home.to_string_lossy().to_string();
        let summary = migrate_fs_to_db(&fs, &db, &home_str).await.unwrap();
        assert_eq!(summary.migrated, 2);
        assert_eq!(summary.failed, 0);

        // second run must not touch user data again
        let second = migrate_fs_to_db(&fs, &db, &home_str).await.unwrap();
        assert_eq!(second.migrated, 0);
        assert_eq!(second.total, 0);
    }

    #[tokio::test]
    async fn test_db_to_fs_does_not_overwrite_existing_file() {
        let Some(url) = test_db_url() else {
            eprintln!("skipping: OPENCLAW_TEST_DB_URL not set");
            return;
        };

        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let state_dir = home.join(".openclaw");
        std::fs::create_dir_all(&state_dir).unwrap();

        let db = DbBackend::connect(&url).await.unwrap();
        sqlx::query("DELETE FROM kv").execute(db.pool()).await.unwrap();
        let home_str = home.to_string_lossy().to_string();
        let key_a = ".openclaw/a.json";
        db.write_json(key_a, json!({"from": "db"})).await.unwrap();
        db.flush().await.unwrap();

        // pre-existing file must win
        std::fs::write(state_dir.join("a.json"), serde_json::to_string(&json!({"from": "disk"})).unwrap()).unwrap();

        let fs = FsBackend::new(state_dir.clone()).unwrap();
        let summary = migrate_db_to_fs(&fs, &db, &home_str).await.unwrap();
        assert_eq!(summary.failed, 0);

        let on_disk = crate::store::load_json(&state_dir.join("a.json")).unwrap().unwrap();
        assert_eq!(on_disk, json!({"from": "disk"}));
    }
}
