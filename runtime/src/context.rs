//! Wiring of the production backends.
//!
//! [`AppContext::connect`] opens both database pools and the Redis cache and
//! builds the saga coordinator on top. An unreachable cache is not fatal: the
//! service then runs with a disabled cache layer and reads go to the stores.

use crate::cache::{CacheLayer, CacheSettings};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::health::{Component, HealthCheck, HealthReport};
use crate::service::ApplicationService;
use certflow_core::collaborators::{CertificateIssuer, Notifier};
use certflow_core::completeness::CompletenessPolicy;
use certflow_core::environment::{Clock, SystemClock};
use certflow_core::error::{StoreError, StoreKind};
use certflow_core::saga::{SagaLog, SagaPhase};
use certflow_postgres::{
    PostgresDocumentStore, PostgresRelationalStore, PostgresSagaLog, connect, migrate_documents,
    migrate_relational, ping,
};
use certflow_redis::RedisCache;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Coordinator over the `PostgreSQL` stores.
pub type PostgresCoordinator = Coordinator<PostgresRelationalStore, PostgresDocumentStore>;

/// Service over the production backends.
pub type PostgresService =
    ApplicationService<PostgresRelationalStore, PostgresDocumentStore, RedisCache>;

/// Partial commits counted by the health check.
const HEALTH_PARTIAL_COMMIT_LIMIT: i64 = 1_000;

/// Connected backends.
pub struct AppContext {
    config: Config,
    relational: Arc<PostgresRelationalStore>,
    documents: Arc<PostgresDocumentStore>,
    saga_log: Arc<PostgresSagaLog>,
    cache: Option<RedisCache>,
    clock: Arc<dyn Clock>,
}

impl AppContext {
    /// Connect to every backend described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if either database is unreachable. A Redis
    /// failure is logged and the cache disabled.
    pub async fn connect(config: Config) -> Result<Self, StoreError> {
        let relational_pool = connect(&config.relational.pool_settings(), StoreKind::Relational).await?;
        let document_pool = connect(&config.documents.pool_settings(), StoreKind::Document).await?;

        let cache_timeout = Duration::from_millis(config.redis.timeout_ms);
        let cache = match tokio::time::timeout(
            cache_timeout.max(Duration::from_secs(1)),
            RedisCache::new(&config.redis.url),
        )
        .await
        {
            Ok(Ok(cache)) => {
                tracing::info!("Redis cache connected");
                Some(cache)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Redis unavailable, running without cache");
                None
            }
            Err(_) => {
                tracing::warn!("Redis connection timed out, running without cache");
                None
            }
        };

        let threshold = config.slow_operation_threshold();
        Ok(Self {
            relational: Arc::new(PostgresRelationalStore::new(relational_pool.clone(), threshold)),
            documents: Arc::new(PostgresDocumentStore::new(document_pool, threshold)),
            saga_log: Arc::new(PostgresSagaLog::new(relational_pool)),
            cache,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Apply pending migrations to both databases.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        migrate_relational(self.relational.pool()).await?;
        migrate_documents(self.documents.pool()).await
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// A saga coordinator over the stores.
    #[must_use]
    pub fn coordinator(&self) -> PostgresCoordinator {
        let saga_log: Arc<dyn SagaLog> = self.saga_log.clone();
        Coordinator::new(
            Arc::clone(&self.relational),
            Arc::clone(&self.documents),
            saga_log,
            Arc::clone(&self.clock),
        )
    }

    /// Cache layer with the configured TTLs; disabled when Redis is down.
    #[must_use]
    pub fn cache_layer(&self) -> CacheLayer<RedisCache> {
        let workflow = &self.config.workflow;
        let settings = CacheSettings {
            timeout: Duration::from_millis(self.config.redis.timeout_ms),
            application_ttl: Duration::from_secs(workflow.application_cache_ttl),
            stats_ttl: Duration::from_secs(workflow.stats_cache_ttl),
        };
        match &self.cache {
            Some(cache) => CacheLayer::new(cache.clone(), settings),
            None => CacheLayer::disabled(settings),
        }
    }

    /// Build the application service.
    #[must_use]
    pub fn service(
        &self,
        issuer: Arc<dyn CertificateIssuer>,
        notifier: Arc<dyn Notifier>,
    ) -> PostgresService {
        ApplicationService::new(
            self.coordinator(),
            self.cache_layer(),
            issuer,
            notifier,
            Arc::clone(&self.clock),
        )
        .with_policy(
            CompletenessPolicy::default().with_threshold(self.config.workflow.completeness_threshold),
        )
    }

    /// Probe every backend.
    pub async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let relational = ping(self.relational.pool(), StoreKind::Relational).await;
        let relational = HealthCheck::database(Component::Relational, relational, started.elapsed());

        let started = Instant::now();
        let documents = ping(self.documents.pool(), StoreKind::Document).await;
        let documents = HealthCheck::database(Component::Documents, documents, started.elapsed());

        let started = Instant::now();
        let cache = match &self.cache {
            Some(cache) => Some(cache.ping().await),
            None => None,
        };
        let cache = HealthCheck::cache(cache, started.elapsed());

        let unresolved = self
            .saga_log
            .list_by_phase(SagaPhase::PartialCommit, None, HEALTH_PARTIAL_COMMIT_LIMIT)
            .await
            .map(|entries| entries.len());
        let saga_log = HealthCheck::saga_log(unresolved);

        HealthReport::new(vec![relational, documents, cache, saga_log], self.clock.now())
    }

    /// Close both pools.
    pub async fn shutdown(&self) {
        self.relational.pool().close().await;
        self.documents.pool().close().await;
        tracing::info!("Database pools closed");
    }
}
