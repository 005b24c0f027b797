//! Durable saga log.
//!
//! One row per saga in the `saga_log` table. The operation list is stored as
//! JSONB so an operator (or the recovery sweep) can rebuild compensations
//! after a crash.

use certflow_core::error::{StoreError, StoreKind};
use certflow_core::ids::{TransactionId, UserId};
use certflow_core::saga::{PhaseUpdate, SagaEntry, SagaLog, SagaPhase};
use certflow_core::store::StoreOp;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const STORE: StoreKind = StoreKind::SagaLog;

fn log_error(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::new(STORE, format!("{context}: {e}"))
}

/// `PostgreSQL`-backed [`SagaLog`].
///
/// # Example
///
/// ```no_run
/// use certflow_core::saga::{SagaLog, SagaPhase};
/// use certflow_postgres::PostgresSagaLog;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let log = PostgresSagaLog::new(pool);
///
/// let stuck = log.list_by_phase(SagaPhase::PartialCommit, None, 100).await?;
/// println!("Sagas awaiting reconciliation: {}", stuck.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresSagaLog {
    pool: PgPool,
}

impl PostgresSagaLog {
    /// Create a saga log on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, entry: SagaEntry) -> Result<(), StoreError> {
        let operations = serde_json::to_value(&entry.operations)
            .map_err(|e| log_error("Failed to serialize operations", e))?;

        sqlx::query(
            r"
            INSERT INTO saga_log (
                transaction_id, label, phase, operations, failed_step, error,
                resolved_by, resolution_notes, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(entry.transaction_id.as_uuid())
        .bind(&entry.label)
        .bind(entry.phase.as_str())
        .bind(operations)
        .bind(step_column(entry.failed_step))
        .bind(&entry.error)
        .bind(entry.resolved_by.map(|id| *id.as_uuid()))
        .bind(&entry.resolution_notes)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| log_error("Failed to record saga", e))?;

        tracing::debug!(
            transaction_id = %entry.transaction_id,
            label = %entry.label,
            operations = entry.operations.len(),
            "Saga recorded"
        );
        Ok(())
    }

    async fn set_phase(
        &self,
        transaction_id: TransactionId,
        update: PhaseUpdate,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE saga_log
            SET phase = $2,
                failed_step = COALESCE($3, failed_step),
                error = COALESCE($4, error),
                updated_at = $5
            WHERE transaction_id = $1
            ",
        )
        .bind(transaction_id.as_uuid())
        .bind(update.phase.as_str())
        .bind(step_column(update.failed_step))
        .bind(&update.error)
        .bind(update.at)
        .execute(&self.pool)
        .await
        .map_err(|e| log_error("Failed to update saga phase", e))?;

        if result.rows_affected() == 0 {
            return Err(log_error("Unknown saga", transaction_id));
        }

        if update.phase == SagaPhase::PartialCommit {
            tracing::error!(
                transaction_id = %transaction_id,
                error = update.error.as_deref().unwrap_or_default(),
                "Saga left stores inconsistent"
            );
            metrics::counter!("certflow_saga_log_partial_commits_total").increment(1);
        }
        Ok(())
    }

    async fn fetch(&self, transaction_id: TransactionId) -> Result<Option<SagaEntry>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT transaction_id, label, phase, operations, failed_step, error,
                   resolved_by, resolution_notes, created_at, updated_at
            FROM saga_log
            WHERE transaction_id = $1
            ",
        )
        .bind(transaction_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| log_error("Failed to fetch saga", e))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(
        &self,
        phase: SagaPhase,
        older_than: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<SagaEntry>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT transaction_id, label, phase, operations, failed_step, error,
                   resolved_by, resolution_notes, created_at, updated_at
            FROM saga_log
            WHERE phase = $1 AND ($2::timestamptz IS NULL OR updated_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            ",
        )
        .bind(phase.as_str())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| log_error("Failed to list sagas", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn resolve(
        &self,
        transaction_id: TransactionId,
        resolved_by: UserId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE saga_log
            SET phase = $2, resolved_by = $3, resolution_notes = $4, updated_at = $5
            WHERE transaction_id = $1
            ",
        )
        .bind(transaction_id.as_uuid())
        .bind(SagaPhase::Resolved.as_str())
        .bind(resolved_by.as_uuid())
        .bind(&notes)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| log_error("Failed to resolve saga", e))?;

        if result.rows_affected() == 0 {
            return Err(log_error("Unknown saga", transaction_id));
        }

        tracing::info!(
            transaction_id = %transaction_id,
            resolved_by = %resolved_by,
            "Saga marked resolved"
        );
        metrics::counter!("certflow_saga_log_resolved_total").increment(1);
        Ok(())
    }
}

fn step_column(step: Option<usize>) -> Option<i32> {
    step.map(|s| i32::try_from(s).unwrap_or(i32::MAX))
}

fn row_to_entry(row: &PgRow) -> Result<SagaEntry, StoreError> {
    let get_err = |e: sqlx::Error| log_error("Failed to decode saga row", e);

    let transaction_id: Uuid = row.try_get("transaction_id").map_err(get_err)?;
    let phase: String = row.try_get("phase").map_err(get_err)?;
    let operations: serde_json::Value = row.try_get("operations").map_err(get_err)?;
    let failed_step: Option<i32> = row.try_get("failed_step").map_err(get_err)?;
    let resolved_by: Option<Uuid> = row.try_get("resolved_by").map_err(get_err)?;

    Ok(SagaEntry {
        transaction_id: TransactionId::from_uuid(transaction_id),
        label: row.try_get("label").map_err(get_err)?,
        phase: phase
            .parse::<SagaPhase>()
            .map_err(|e| log_error("Invalid phase", e))?,
        operations: serde_json::from_value::<Vec<StoreOp>>(operations)
            .map_err(|e| log_error("Invalid operations", e))?,
        failed_step: failed_step.and_then(|s| usize::try_from(s).ok()),
        error: row.try_get("error").map_err(get_err)?,
        resolved_by: resolved_by.map(UserId::from_uuid),
        resolution_notes: row.try_get("resolution_notes").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

impl SagaLog for PostgresSagaLog {
    fn record(
        &self,
        entry: SagaEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.insert(entry))
    }

    fn update_phase(
        &self,
        transaction_id: TransactionId,
        update: PhaseUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.set_phase(transaction_id, update))
    }

    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaEntry>, StoreError>> + Send + '_>> {
        Box::pin(self.fetch(transaction_id))
    }

    fn list_by_phase(
        &self,
        phase: SagaPhase,
        older_than: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaEntry>, StoreError>> + Send + '_>> {
        Box::pin(self.list(phase, older_than, limit))
    }

    fn mark_resolved(
        &self,
        transaction_id: TransactionId,
        resolved_by: UserId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.resolve(transaction_id, resolved_by, notes, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_column_saturates() {
        assert_eq!(step_column(None), None);
        assert_eq!(step_column(Some(3)), Some(3));
        assert_eq!(step_column(Some(usize::MAX)), Some(i32::MAX));
    }
}
