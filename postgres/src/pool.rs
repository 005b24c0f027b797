//! Connection pools and operation timing.

use certflow_core::error::{StoreError, StoreKind};
use sqlx::Executor;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};

/// Longest operation text written to a slow-operation warning.
pub const MAX_LOGGED_OPERATION_LEN: usize = 256;

/// Pool settings for one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connection URL
    pub url: String,
    /// Maximum pool size
    pub max_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
    /// How long an idle connection is kept
    pub idle_timeout: Duration,
    /// Server-side `statement_timeout` for every connection
    pub statement_timeout: Duration,
}

impl PoolSettings {
    /// Settings with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

/// Open a pool for `store`.
///
/// # Errors
///
/// Returns a [`StoreError`] if the database is unreachable.
pub async fn connect(settings: &PoolSettings, store: StoreKind) -> Result<PgPool, StoreError> {
    let statement_timeout_ms = settings.statement_timeout.as_millis();

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(&settings.url)
        .await
        .map_err(|e| StoreError::new(store, format!("Failed to connect: {e}")))?;

    tracing::info!(
        store = %store,
        max_connections = settings.max_connections,
        "Database pool ready"
    );

    Ok(pool)
}

/// Round-trip `SELECT 1` on `pool`.
///
/// # Errors
///
/// Returns a [`StoreError`] if no connection can be acquired or the query fails.
pub async fn ping(pool: &PgPool, store: StoreKind) -> Result<(), StoreError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| db_error(store, "Ping failed", &e))?;
    Ok(())
}

pub(crate) fn db_error(store: StoreKind, context: &str, error: &sqlx::Error) -> StoreError {
    StoreError::new(store, format!("{context}: {error}"))
}

/// Truncate `text` to at most `max` characters.
#[must_use]
pub fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Time a store operation, warning when it exceeds `threshold`.
///
/// `describe` only runs on the slow path.
pub(crate) async fn observe<T, F, D>(
    store: StoreKind,
    threshold: Duration,
    describe: D,
    future: F,
) -> T
where
    F: Future<Output = T>,
    D: FnOnce() -> String,
{
    let started = Instant::now();
    let output = future.await;
    let elapsed = started.elapsed();

    metrics::histogram!("certflow_store_operation_duration_seconds", "store" => store.as_str())
        .record(elapsed.as_secs_f64());

    if elapsed > threshold {
        #[allow(clippy::cast_possible_truncation)] // Durations here are far below u64::MAX ms
        let elapsed_ms = elapsed.as_millis() as u64;
        let operation = describe();
        tracing::warn!(
            store = %store,
            elapsed_ms,
            operation = truncate(&operation, MAX_LOGGED_OPERATION_LEN),
            "Slow store operation"
        );
        metrics::counter!("certflow_store_slow_operations_total", "store" => store.as_str())
            .increment(1);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ééé", 2), "éé");
    }

    #[test]
    fn default_settings() {
        let settings = PoolSettings::new("postgres://localhost/certflow");
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn observe_returns_inner_output() {
        let value = observe(
            StoreKind::Relational,
            Duration::ZERO,
            || "SELECT 1".to_owned(),
            async { 7 },
        )
        .await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn operation_is_described_only_when_slow() {
        let described = Cell::new(0);
        let describe = || {
            described.set(described.get() + 1);
            "UPDATE applications".to_owned()
        };

        observe(StoreKind::Relational, Duration::MAX, describe, async {}).await;
        assert_eq!(described.get(), 0);

        let describe = || {
            described.set(described.get() + 1);
            "UPDATE applications".to_owned()
        };
        observe(StoreKind::Relational, Duration::ZERO, describe, async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        })
        .await;
        assert_eq!(described.get(), 1);
    }
}
