//! Redis cache backend for certflow.
//!
//! Values are plain strings stored with `SET ... EX`. Every key is written
//! under a namespace (default `certflow:`) so prefix deletion never touches
//! keys owned by other services on the same instance.
//!
//! # Example
//!
//! ```no_run
//! use certflow_redis::RedisCache;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use certflow_core::error::{StoreError, StoreKind};
use certflow_core::store::Cache;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Namespace used by [`RedisCache::new`].
pub const DEFAULT_NAMESPACE: &str = "certflow:";

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

fn cache_error(context: &str, e: &redis::RedisError) -> StoreError {
    StoreError::new(StoreKind::Cache, format!("{context}: {e}"))
}

/// [`Cache`] backed by Redis.
#[derive(Clone)]
pub struct RedisCache {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    namespace: String,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect with the default namespace.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the client cannot be created or the first
    /// connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        Self::with_namespace(redis_url, DEFAULT_NAMESPACE).await
    }

    /// Connect with a custom key namespace.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the client cannot be created or the first
    /// connection fails.
    pub async fn with_namespace(
        redis_url: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client =
            Client::open(redis_url).map_err(|e| cache_error("Failed to create Redis client", &e))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| cache_error("Failed to create Redis connection manager", &e))?;

        Ok(Self {
            conn_manager,
            namespace: namespace.into(),
        })
    }

    /// Send `PING`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if Redis does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_error("Ping failed", &e))?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    fn pattern(&self, prefix: &str) -> String {
        format!("{}*", escape_glob(&self.key(prefix)))
    }
}

/// Escape the glob metacharacters Redis `MATCH` understands.
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.get(self.key(key))
            .await
            .map_err(|e| cache_error("Failed to get key", &e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let ttl_seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(self.key(key), value, ttl_seconds)
            .await
            .map_err(|e| cache_error("Failed to set key", &e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(self.key(key))
            .await
            .map_err(|e| cache_error("Failed to delete key", &e))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn_manager.clone();
        let pattern = self.pattern(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| cache_error("Failed to scan keys", &e))?;

            if !keys.is_empty() {
                let deleted: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| cache_error("Failed to delete keys", &e))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(prefix = prefix, removed = removed, "Deleted cache keys by prefix");
        Ok(removed)
    }
}
