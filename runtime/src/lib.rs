//! # certflow runtime
//!
//! Runs the certification workflow over a relational store, a document store
//! and a cache.
//!
//! ## Core Components
//!
//! - **Coordinator**: applies a saga plan across both stores, logging every
//!   phase so partial commits can be found and compensated
//! - **Cache layer**: fail-open, timeout-bounded cache of merged applications
//!   and statistics
//! - **Application service**: the workflow operations, authorization and
//!   notification dispatch
//! - **Context**: wiring of the `PostgreSQL` and Redis backends, health probes
//!
//! ## Example
//!
//! ```ignore
//! use certflow_runtime::{AppContext, Config, TracingNotifier};
//! use std::sync::Arc;
//!
//! let context = AppContext::connect(Config::from_env()?).await?;
//! context.migrate().await?;
//! let service = context.service(issuer, Arc::new(TracingNotifier));
//!
//! let created = service.create_application(applicant, product_id, form).await?;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod service;

pub use cache::{CacheLayer, CacheSettings};
pub use config::{Config, ConfigError};
pub use context::{AppContext, PostgresCoordinator, PostgresService};
pub use coordinator::{Coordinator, RecoveryReport};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use metrics::{MetricsError, MetricsServer};
pub use notify::TracingNotifier;
pub use service::ApplicationService;
