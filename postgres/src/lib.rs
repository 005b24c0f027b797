//! `PostgreSQL` adapters for certflow.
//!
//! This crate provides the three durable backends the workflow runs on:
//!
//! - [`PostgresRelationalStore`]: the authoritative `applications` table with
//!   version-checked updates
//! - [`PostgresDocumentStore`]: JSONB documents addressed by path
//! - [`PostgresSagaLog`]: the durable log of saga phases
//!
//! The relational store and the document store may point at different
//! databases; each has its own migration set.
//!
//! # Example
//!
//! ```ignore
//! use certflow_core::error::StoreKind;
//! use certflow_postgres::{PoolSettings, PostgresRelationalStore, connect, migrate_relational};
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect(&PoolSettings::new("postgres://localhost/certflow"), StoreKind::Relational).await?;
//!     migrate_relational(&pool).await?;
//!     let store = PostgresRelationalStore::new(pool, Duration::from_millis(500));
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod document;
pub mod pool;
pub mod relational;
pub mod saga_log;

pub use document::{PostgresDocumentStore, PostgresDocumentTx};
pub use pool::{PoolSettings, connect, ping};
pub use relational::{PostgresRelationalStore, PostgresRelationalTx};
pub use saga_log::PostgresSagaLog;

use certflow_core::error::{StoreError, StoreKind};
use sqlx::PgPool;
use sqlx::migrate::Migrator;

/// Migrations for the relational database (`applications`, `saga_log`).
pub static RELATIONAL_MIGRATOR: Migrator = sqlx::migrate!("./migrations/relational");

/// Migrations for the document database (`documents`).
pub static DOCUMENT_MIGRATOR: Migrator = sqlx::migrate!("./migrations/documents");

/// Run the relational migrations.
///
/// # Errors
///
/// Returns a [`StoreError`] if a migration fails.
pub async fn migrate_relational(pool: &PgPool) -> Result<(), StoreError> {
    RELATIONAL_MIGRATOR
        .run(pool)
        .await
        .map_err(|e| StoreError::new(StoreKind::Relational, format!("Migration failed: {e}")))?;
    tracing::info!("Relational migrations applied");
    Ok(())
}

/// Run the document store migrations.
///
/// # Errors
///
/// Returns a [`StoreError`] if a migration fails.
pub async fn migrate_documents(pool: &PgPool) -> Result<(), StoreError> {
    DOCUMENT_MIGRATOR
        .run(pool)
        .await
        .map_err(|e| StoreError::new(StoreKind::Document, format!("Migration failed: {e}")))?;
    tracing::info!("Document migrations applied");
    Ok(())
}
