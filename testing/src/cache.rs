//! In-memory cache backend.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use crate::faults::Faults;
use certflow_core::error::StoreError;
use certflow_core::store::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, (String, Instant)>,
    latency: Option<Duration>,
    sets: usize,
}

/// TTL-aware in-memory cache with outage and latency injection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCache {
    state: Arc<Mutex<CacheState>>,
    faults: Faults,
}

impl InMemoryCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty cache sharing a failure switchboard.
    #[must_use]
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            state: Arc::default(),
            faults,
        }
    }

    /// Delay every call by `latency` (to exercise timeouts).
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Whether a live entry exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    /// All stored keys, live or expired.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().entries.keys().cloned().collect()
    }

    /// Number of successful `set` calls.
    #[must_use]
    pub fn set_count(&self) -> usize {
        self.state.lock().unwrap().sets
    }

    async fn delay(&self) {
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.delay().await;
        self.faults.check_cache()?;
        let mut state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.delay().await;
        self.faults.check_cache()?;
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        state.sets += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delay().await;
        self.faults.check_cache()?;
        self.state.lock().unwrap().entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.delay().await;
        self.faults.check_cache()?;
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - state.entries.len()) as u64)
    }
}
