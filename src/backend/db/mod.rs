//! Database backend (§4.F): write-through cache, per-key ordered async
//! writes, and an advisory-lock transaction for the update protocol.

mod schema;

use super::{StateBackend, UpdateOutcome};
use crate::error::StateError;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// `2^53 - 1`: the largest integer a JS-hosted caller of this same contract
/// can represent exactly. `stable_lock_id` stays inside this range so the
/// id round-trips through any driver, including ones built for JS callers.
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

const TEXT_MARKER_FIELD: &str = "__text";

/// Deterministic `pg_advisory_xact_lock` id for `key` (§4.F).
///
/// First 8 bytes of SHA-256(key), read as a signed big-endian `i64`, then
/// `abs(..) % MAX_SAFE_INTEGER`. Two different keys collide only if their
/// hash prefixes collide, which `updateJsonWithLock` tolerates: a
/// collision just serializes two unrelated keys against each other, it
/// never corrupts either one.
fn stable_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let n = i64::from_be_bytes(bytes);
    ((n as i128).unsigned_abs() % MAX_SAFE_INTEGER as i128) as i64
}

type PerKeyChain = Arc<tokio::sync::Mutex<()>>;

/// Process-wide cache plus the bookkeeping needed to order and observe
/// background writes (§3 Cache, §4.F, §9).
struct Shared {
    pool: PgPool,
    cache: Mutex<HashMap<String, Value>>,
    chains: Mutex<HashMap<String, PerKeyChain>>,
    /// Monotonic per-key write counter. `write_json` captures the post-
    /// increment value as its own generation and, on failure, reverts the
    /// cache only if this map still names that exact generation as the
    /// latest for the key — content equality isn't enough to tell "no later
    /// mutation happened" from "a later mutation wrote the same value".
    generations: Mutex<HashMap<String, u64>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    preloaded: AtomicBool,
    preload_inflight: tokio::sync::Mutex<()>,
}

/// Store contract implementation over a single `kv` table (§4.F, §6).
#[derive(Clone)]
pub struct DbBackend {
    shared: Arc<Shared>,
}

impl DbBackend {
    /// The underlying connection pool, for callers that need to issue
    /// queries the store contract doesn't expose (the migrator's bulk
    /// `SELECT`/`ON CONFLICT DO NOTHING` passes, §4.H).
    pub fn pool(&self) -> &PgPool {
        &self.shared.pool
    }

    /// Connect, run pending migrations (§4.E), and return a backend whose
    /// cache is still empty — call [`DbBackend::ensure_preloaded`] (or let
    /// the backend selector call it) before relying on synchronous reads.
    pub async fn connect(database_url: &str) -> Result<Self, StateError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;
        schema::apply_migrations(&pool)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                cache: Mutex::new(HashMap::new()),
                chains: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                preloaded: AtomicBool::new(false),
                preload_inflight: tokio::sync::Mutex::new(()),
            }),
        })
    }

    fn chain_for(&self, key: &str) -> PerKeyChain {
        let mut chains = self.shared.chains.lock().unwrap();
        Arc::clone(
            chains
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Bump and return this write's generation number for `key` (§3, §4.F).
    fn next_generation(&self, key: &str) -> u64 {
        let mut generations = self.shared.generations.lock().unwrap();
        let slot = generations.entry(key.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.shared.pending.lock().unwrap().push(handle);
    }

    /// Replace the cache with the authoritative row set (§4.F `preloadAll`).
    pub async fn preload_all(&self) -> Result<(), StateError> {
        let rows = sqlx::query("SELECT key, data FROM kv")
            .fetch_all(&self.shared.pool)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;

        let mut fresh = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let data: Value = row.get("data");
            fresh.insert(key, data);
        }

        *self.shared.cache.lock().unwrap() = fresh;
        self.shared.preloaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Targeted warm-up for a specific set of keys (§4.F `preload`).
    pub async fn preload(&self, keys: &[String]) -> Result<(), StateError> {
        if keys.is_empty() {
            return Ok(());
        }
        let rows = sqlx::query("SELECT key, data FROM kv WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(&self.shared.pool)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;

        let mut cache = self.shared.cache.lock().unwrap();
        for row in rows {
            let key: String = row.get("key");
            let data: Value = row.get("data");
            cache.insert(key, data);
        }
        Ok(())
    }

    /// Memoized `preload_all` (§4.F `ensurePreloaded`): a no-op once the
    /// backend has successfully preloaded; errors propagate so startup
    /// can fail fast rather than silently serving an empty cache.
    pub async fn ensure_preloaded(&self) -> Result<(), StateError> {
        if self.shared.preloaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.shared.preload_inflight.lock().await;
        if self.shared.preloaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.preload_all().await
    }

    fn warn_if_not_preloaded(&self, key: &str) {
        if !self.shared.preloaded.load(Ordering::Acquire) {
            tracing::warn!(key, "readJson before preloadAll completed; triggering background preload");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.preload_all().await {
                    tracing::error!(error = %e, "background preloadAll failed");
                }
            });
        }
    }
}

#[async_trait]
impl StateBackend for DbBackend {
    fn read_json(&self, key: &str) -> Result<Option<Value>, StateError> {
        let value = self.shared.cache.lock().unwrap().get(key).cloned();
        if value.is_none() {
            self.warn_if_not_preloaded(key);
        }
        Ok(value)
    }

    fn read_json5(&self, key: &str) -> Result<Option<Value>, StateError> {
        self.read_json(key)
    }

    fn read_text(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.read_json(key)?.and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Object(ref map) => map
                .get(TEXT_MARKER_FIELD)
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
            _ => None,
        }))
    }

    async fn write_json(&self, key: &str, document: Value) -> Result<(), StateError> {
        let published = document.clone();
        let prior = {
            let mut cache = self.shared.cache.lock().unwrap();
            cache.insert(key.to_string(), document)
        };
        let my_generation = self.next_generation(key);

        let chain = self.chain_for(key);
        let pool = self.shared.pool.clone();
        let shared = Arc::clone(&self.shared);
        let key_owned = key.to_string();
        let handle = tokio::spawn(async move {
            let _slot = chain.lock().await;
            let outcome = sqlx::query(
                "INSERT INTO kv (key, data, updated_at) VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            )
            .bind(&key_owned)
            .bind(&published)
            .execute(&pool)
            .await;

            if let Err(e) = outcome {
                tracing::error!(key = %key_owned, error = %e, "background write failed");
                // Generation, not value equality: a later write of the same
                // content would otherwise look indistinguishable from "no
                // later write happened" and this task would wrongly revert
                // a cache entry a later, already-committed write produced.
                let still_ours = shared.generations.lock().unwrap().get(&key_owned) == Some(&my_generation);
                if still_ours {
                    let mut guard = shared.cache.lock().unwrap();
                    match prior {
                        Some(p) => {
                            guard.insert(key_owned, p);
                        }
                        None => {
                            guard.remove(&key_owned);
                        }
                    }
                } else {
                    tracing::warn!(key = %key_owned, "not reverting cache: superseded by a later mutation");
                }
            }
        });
        self.track(handle);
        Ok(())
    }

    async fn write_json_with_backup(&self, key: &str, document: Value) -> Result<(), StateError> {
        self.write_json(key, document).await
    }

    async fn write_text(&self, key: &str, content: String) -> Result<(), StateError> {
        let wrapped = serde_json::json!({ TEXT_MARKER_FIELD: content });
        self.write_json(key, wrapped).await
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        let prior = self.shared.cache.lock().unwrap().remove(key);

        let chain = self.chain_for(key);
        let pool = self.shared.pool.clone();
        let shared = Arc::clone(&self.shared);
        let key_owned = key.to_string();
        let handle = tokio::spawn(async move {
            let _slot = chain.lock().await;
            let outcome = sqlx::query("DELETE FROM kv WHERE key = $1")
                .bind(&key_owned)
                .execute(&pool)
                .await;

            if let Err(e) = outcome {
                tracing::error!(key = %key_owned, error = %e, "background delete failed");
                let mut guard = shared.cache.lock().unwrap();
                if !guard.contains_key(&key_owned) {
                    if let Some(p) = prior {
                        guard.insert(key_owned, p);
                    }
                } else {
                    tracing::warn!(key = %key_owned, "not restoring cache: superseded by a later mutation");
                }
            }
        });
        self.track(handle);
        Ok(())
    }

    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: Box<dyn FnOnce(Option<Value>) -> Result<UpdateOutcome, StateError> + Send>,
    ) -> Result<Value, StateError> {
        let lock_id = stable_lock_id(key);
        let mut tx = self
            .shared
            .pool
            .begin()
            .await
            .map_err(|e| StateError::Transport(e.into()))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;

        let current: Option<Value> = sqlx::query("SELECT data FROM kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StateError::Transport(e.into()))?
            .map(|row| row.get("data"));

        let outcome = updater(current.clone())?;

        if outcome.changed {
            sqlx::query(
                "INSERT INTO kv (key, data, updated_at) VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            )
            .bind(key)
            .bind(&outcome.result)
            .execute(&mut *tx)
            .await
            .map_err(|e| StateError::Transport(e.into()))?;
        }

        tx.commit().await.map_err(|e| StateError::Transport(e.into()))?;

        let mut cache = self.shared.cache.lock().unwrap();
        if outcome.changed {
            cache.insert(key.to_string(), outcome.result.clone());
        } else if let Some(c) = current {
            cache.insert(key.to_string(), c);
        } else {
            cache.remove(key);
        }

        Ok(outcome.result)
    }

    async fn flush(&self) -> Result<(), StateError> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
