//! Two-tier cache and durable key/value store
//!
//! Reads hit process memory first, then the `kv_entries` table; writes go to
//! both. Cached payloads are wrapped in an envelope carrying `stored_at` so
//! callers can distinguish fresh from stale within the durable TTL. The raw
//! kv primitives back the cross-process run lock and abort flags.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::EngineResult;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    stored_at: DateTime<Utc>,
    payload: T,
}

#[derive(Clone)]
struct MemEntry {
    raw: String,
    expires_at: Option<DateTime<Utc>>,
}

/// A cache read plus the entry's age; callers compare against their own
/// fresh TTL.
pub struct CacheHit<T> {
    pub value: T,
    pub age_seconds: f64,
}

pub struct CacheService {
    db: PgPool,
    memory: Mutex<HashMap<String, MemEntry>>,
}

impl CacheService {
    pub const WU_KEY_POOL: &'static str = "cache:wu:key_pool";
    pub const WU_ACTIVE_KEY: &'static str = "cache:wu:active_key";
    pub const SCRAPER_PREFIX: &'static str = "cache:scraper:";

    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn scraper_key(source: &str, region_code: &str) -> String {
        format!("{}{source}:{region_code}", Self::SCRAPER_PREFIX)
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        payload: &T,
        ttl: Duration,
    ) -> EngineResult<()> {
        let envelope = Envelope {
            stored_at: Utc::now(),
            payload,
        };
        let raw = serde_json::to_string(&envelope)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3
            "#,
        )
        .bind(key)
        .bind(&raw)
        .bind(expires_at)
        .execute(&self.db)
        .await?;

        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(
                key.to_string(),
                MemEntry {
                    raw,
                    expires_at: Some(expires_at),
                },
            );
        }
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> EngineResult<Option<CacheHit<T>>> {
        let now = Utc::now();

        let cached = self
            .memory
            .lock()
            .ok()
            .and_then(|memory| memory.get(key).cloned());
        if let Some(entry) = cached {
            if entry.expires_at.map(|e| e > now).unwrap_or(true) {
                if let Ok(envelope) = serde_json::from_str::<Envelope<T>>(&entry.raw) {
                    let age = (now - envelope.stored_at).num_milliseconds() as f64 / 1000.0;
                    return Ok(Some(CacheHit {
                        value: envelope.payload,
                        age_seconds: age.max(0.0),
                    }));
                }
            }
        }

        let row: Option<(String, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_entries WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.db)
                .await?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at.map(|e| e <= now).unwrap_or(false) {
            return Ok(None);
        }
        let Ok(envelope) = serde_json::from_str::<Envelope<T>>(&raw) else {
            return Ok(None);
        };

        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.to_string(), MemEntry { raw, expires_at });
        }

        let age = (now - envelope.stored_at).num_milliseconds() as f64 / 1000.0;
        Ok(Some(CacheHit {
            value: envelope.payload,
            age_seconds: age.max(0.0),
        }))
    }

    pub async fn delete(&self, key: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.remove(key);
        }
        Ok(())
    }

    /// Invalidates both tiers for every key under the prefix.
    pub async fn clear_prefix(&self, prefix: &str) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key LIKE $1 || '%'")
            .bind(prefix)
            .execute(&self.db)
            .await?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.retain(|key, _| !key.starts_with(prefix));
        }
        Ok(result.rows_affected())
    }

    pub fn clear_memory(&self) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.clear();
        }
    }

    // ------------------------------------------------------------------
    // Raw kv primitives (run lock, abort flags). Durable tier only: lock
    // semantics must not be satisfied from process memory.
    // ------------------------------------------------------------------

    /// Atomic insert; false when the key already exists and is unexpired.
    pub async fn kv_try_insert(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> EngineResult<bool> {
        let expires_at =
            ttl.map(|t| Utc::now() + chrono::Duration::seconds(t.as_secs() as i64));

        // Expired rows are dead; clear them so the insert can win.
        sqlx::query("DELETE FROM kv_entries WHERE key = $1 AND expires_at IS NOT NULL AND expires_at <= NOW()")
            .bind(key)
            .execute(&self.db)
            .await?;

        let result = sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn kv_get(&self, key: &str) -> EngineResult<Option<String>> {
        let row: Option<(String, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_entries WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.and_then(|(value, expires_at)| {
            if expires_at.map(|e| e <= Utc::now()).unwrap_or(false) {
                None
            } else {
                Some(value)
            }
        }))
    }

    pub async fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()> {
        let expires_at =
            ttl.map(|t| Utc::now() + chrono::Duration::seconds(t.as_secs() as i64));
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn kv_delete(&self, key: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Guarded delete for lock eviction: removes the key only while it still
    /// holds the observed value.
    pub async fn kv_delete_if(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(expected)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
