//! Schema migrator (§4.E).
//!
//! Ensures the bookkeeping table `kv_migrations` and the `kv` document table
//! exist, applying any pending migration ids inside a single transaction.
//! `apply_migrations` is idempotent: an id already recorded in
//! `kv_migrations` is skipped, and the whole routine is additionally
//! memoized per-process via [`std::sync::Once`]-style `AtomicBool` so a
//! busy process doesn't repeatedly round-trip the DB to check.

use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};

/// One migration: a stable id plus the SQL it applies. Ids must never be
/// reused or reordered once shipped — `kv_migrations` trusts them as a
/// permanent record of what has already run.
struct Migration {
    id: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    id: "0001_create_kv_table",
    sql: "CREATE TABLE IF NOT EXISTS kv (
        key text PRIMARY KEY,
        data jsonb NOT NULL,
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
}];

static ALREADY_APPLIED: AtomicBool = AtomicBool::new(false);

/// Apply any migration ids not yet recorded in `kv_migrations`, in order,
/// inside a single transaction. Safe to call more than once per process —
/// a process-local flag short-circuits after the first success, and the
/// transaction itself only issues `INSERT`s for ids not already present.
pub async fn apply_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    if ALREADY_APPLIED.load(Ordering::Acquire) {
        return Ok(());
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kv_migrations (
            id text PRIMARY KEY,
            applied_at timestamptz NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    let mut tx = pool.begin().await?;

    let applied: Vec<String> = sqlx::query("SELECT id FROM kv_migrations")
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("id"))
        .collect();

    for migration in MIGRATIONS {
        if applied.iter().any(|a| a == migration.id) {
            continue;
        }
        sqlx::query(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO kv_migrations (id) VALUES ($1)")
            .bind(migration.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    ALREADY_APPLIED.store(true, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db_url() -> Option<String> {
        std::env::var("OPENCLAW_TEST_DB_URL").ok()
    }

    #[tokio::test]
    async fn test_apply_migrations_idempotent() {
        let Some(url) = test_db_url() else {
            eprintln!("skipping: OPENCLAW_TEST_DB_URL not set");
            return;
        };
        ALREADY_APPLIED.store(false, Ordering::Release);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        apply_migrations(&pool).await.unwrap();
        apply_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query("SELECT count(*) AS c FROM kv_migrations")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
