//! Fail-open cache layer.
//!
//! Wraps an optional [`Cache`] backend. Every call is bounded by a timeout;
//! read and delete failures degrade to a miss, write failures are logged and
//! dropped. A layer built with [`CacheLayer::disabled`] behaves as an
//! always-empty cache.

use crate::metrics::CacheMetrics;
use certflow_core::ids::ApplicationId;
use certflow_core::store::{Cache, StatsFilter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Prefix of cached aggregate statistics.
pub const STATS_PREFIX: &str = "application-stats:";

/// Key of a cached merged application.
#[must_use]
pub fn application_key(id: ApplicationId) -> String {
    format!("application:{id}")
}

/// Key of cached statistics for `filter`.
#[must_use]
pub fn stats_key(filter: &StatsFilter) -> String {
    let filter = serde_json::to_string(filter).unwrap_or_default();
    format!("{STATS_PREFIX}{filter}")
}

/// Timeouts and TTLs of the cache layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// Bound on every backend call
    pub timeout: Duration,
    /// TTL of cached applications
    pub application_ttl: Duration,
    /// TTL of cached statistics
    pub stats_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
            application_ttl: Duration::from_secs(300),
            stats_ttl: Duration::from_secs(3_600),
        }
    }
}

/// Best-effort cache in front of the stores.
#[derive(Debug)]
pub struct CacheLayer<C> {
    backend: Option<C>,
    settings: CacheSettings,
}

impl<C: Cache> CacheLayer<C> {
    /// Layer over `backend`.
    #[must_use]
    pub const fn new(backend: C, settings: CacheSettings) -> Self {
        Self {
            backend: Some(backend),
            settings,
        }
    }

    /// Layer without a backend; every read misses.
    #[must_use]
    pub const fn disabled(settings: CacheSettings) -> Self {
        Self {
            backend: None,
            settings,
        }
    }

    /// Whether a backend is attached.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Configured timeouts and TTLs.
    #[must_use]
    pub const fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// Read and decode a value. Misses, failures, timeouts and undecodable
    /// entries all return `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;

        match tokio::time::timeout(self.settings.timeout, backend.get(key)).await {
            Ok(Ok(Some(raw))) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    CacheMetrics::record_hit();
                    Some(value)
                }
                Err(e) => {
                    tracing::debug!(key = key, error = %e, "Discarding undecodable cache entry");
                    CacheMetrics::record_miss();
                    None
                }
            },
            Ok(Ok(None)) => {
                CacheMetrics::record_miss();
                None
            }
            Ok(Err(e)) => {
                tracing::debug!(key = key, error = %e, "Cache read failed, treating as miss");
                CacheMetrics::record_error("get");
                None
            }
            Err(_) => {
                tracing::warn!(key = key, timeout = ?self.settings.timeout, "Cache read timed out");
                CacheMetrics::record_error("get");
                None
            }
        }
    }

    /// Encode and store a value. Never fails.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        match tokio::time::timeout(self.settings.timeout, backend.set(key, &raw, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = key, error = %e, "Cache write failed");
                CacheMetrics::record_error("set");
            }
            Err(_) => {
                tracing::warn!(key = key, timeout = ?self.settings.timeout, "Cache write timed out");
                CacheMetrics::record_error("set");
            }
        }
    }

    /// Delete one key. Never fails.
    pub async fn invalidate(&self, key: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        match tokio::time::timeout(self.settings.timeout, backend.delete(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = key, error = %e, "Cache delete failed");
                CacheMetrics::record_error("delete");
            }
            Err(_) => {
                tracing::warn!(key = key, "Cache delete timed out");
                CacheMetrics::record_error("delete");
            }
        }
    }

    /// Delete every key under `prefix`. Never fails; returns how many keys
    /// were removed (0 on failure).
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        match tokio::time::timeout(self.settings.timeout, backend.delete_prefix(prefix)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(e)) => {
                tracing::warn!(prefix = prefix, error = %e, "Cache prefix delete failed");
                CacheMetrics::record_error("delete_prefix");
                0
            }
            Err(_) => {
                tracing::warn!(prefix = prefix, "Cache prefix delete timed out");
                CacheMetrics::record_error("delete_prefix");
                0
            }
        }
    }

    /// Drop the cached application and every cached statistic.
    pub async fn invalidate_application(&self, id: ApplicationId) {
        self.invalidate(&application_key(id)).await;
        self.invalidate_prefix(STATS_PREFIX).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use certflow_testing::{Faults, InMemoryCache};
    use serde_json::{Value, json};

    fn layer(backend: InMemoryCache) -> CacheLayer<InMemoryCache> {
        CacheLayer::new(
            backend,
            CacheSettings {
                timeout: Duration::from_millis(50),
                ..CacheSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn round_trips_json_values() {
        let cache = layer(InMemoryCache::new());
        cache
            .set_json("application:x", &json!({ "status": "draft" }), Duration::from_secs(60))
            .await;
        let value: Option<Value> = cache.get_json("application:x").await;
        assert_eq!(value, Some(json!({ "status": "draft" })));
    }

    #[tokio::test]
    async fn outage_reads_as_miss_and_writes_are_dropped() {
        let faults = Faults::new();
        let cache = layer(InMemoryCache::with_faults(faults.clone()));
        faults.set_cache_down(true);

        cache.set_json("k", &1, Duration::from_secs(60)).await;
        assert_eq!(cache.get_json::<i32>("k").await, None);
        assert_eq!(cache.invalidate_prefix("k").await, 0);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_miss() {
        let backend = InMemoryCache::new();
        let cache = layer(backend.clone());
        cache.set_json("k", &1, Duration::from_secs(60)).await;

        backend.set_latency(Some(Duration::from_millis(200)));
        assert_eq!(cache.get_json::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let backend = InMemoryCache::new();
        backend.set("k", "not json", Duration::from_secs(60)).await.unwrap();
        let cache = layer(backend);
        assert_eq!(cache.get_json::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn disabled_layer_always_misses() {
        let cache: CacheLayer<InMemoryCache> = CacheLayer::disabled(CacheSettings::default());
        cache.set_json("k", &1, Duration::from_secs(60)).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get_json::<i32>("k").await, None);
    }

    #[test]
    fn stats_keys_share_the_prefix() {
        let key = stats_key(&StatsFilter::default());
        assert_eq!(key, "application-stats:{}");
        assert!(application_key(ApplicationId::new()).starts_with("application:"));
    }
}
