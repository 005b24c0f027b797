//! `applications` table adapter.
//!
//! Every write runs inside a `sqlx` transaction. Updates are conditional on
//! `version` and bump it, so two writers that read the same row cannot both
//! commit.

use crate::pool::{db_error, observe};
use certflow_core::application::{ApplicationRow, RowPatch};
use certflow_core::capability::StaffAssignments;
use certflow_core::error::{ConflictError, StoreError, StoreKind, WorkflowError};
use certflow_core::ids::{ApplicationId, ProductId, UserId};
use certflow_core::workflow::{ApplicationStatus, Stage};
use certflow_core::store::{
    ApplicationStats, Pagination, RelationalOp, RelationalStore, RelationalTransaction, RowPage,
    SearchFilter, StatsFilter,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const STORE: StoreKind = StoreKind::Relational;

const COLUMNS: &str = "id, code, user_id, product_id, status, stage, completeness_score, \
    rejection_count, total_payments, reviewer_id, auditor_id, approver_id, certificate_number, \
    document_id, version, created_at, updated_at";

/// Relational store backed by `PostgreSQL`.
#[derive(Clone, Debug)]
pub struct PostgresRelationalStore {
    pool: PgPool,
    slow_threshold: Duration,
}

impl PostgresRelationalStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, slow_threshold: Duration) -> Self {
        Self {
            pool,
            slow_threshold,
        }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open transaction on the `applications` table.
pub struct PostgresRelationalTx {
    tx: Transaction<'static, Postgres>,
    slow_threshold: Duration,
}

impl std::fmt::Debug for PostgresRelationalTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRelationalTx").finish_non_exhaustive()
    }
}

fn decode_error(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::new(STORE, format!("Invalid value in column {column}: {detail}"))
}

fn row_to_application(row: &PgRow) -> Result<ApplicationRow, StoreError> {
    let get_err = |e: sqlx::Error| db_error(STORE, "Failed to decode application row", &e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let stage: String = row.try_get("stage").map_err(get_err)?;
    let score: i16 = row.try_get("completeness_score").map_err(get_err)?;
    let rejections: i32 = row.try_get("rejection_count").map_err(get_err)?;
    let reviewer: Option<Uuid> = row.try_get("reviewer_id").map_err(get_err)?;
    let auditor: Option<Uuid> = row.try_get("auditor_id").map_err(get_err)?;
    let approver: Option<Uuid> = row.try_get("approver_id").map_err(get_err)?;

    Ok(ApplicationRow {
        id: ApplicationId::from_uuid(row.try_get("id").map_err(get_err)?),
        code: row.try_get("code").map_err(get_err)?,
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(get_err)?),
        product_id: ProductId::from_uuid(row.try_get("product_id").map_err(get_err)?),
        status: status.parse::<ApplicationStatus>().map_err(|e| decode_error("status", e))?,
        stage: stage.parse::<Stage>().map_err(|e| decode_error("stage", e))?,
        completeness_score: u8::try_from(score).map_err(|e| decode_error("completeness_score", e))?,
        rejection_count: u32::try_from(rejections)
            .map_err(|e| decode_error("rejection_count", e))?,
        total_payments: row.try_get("total_payments").map_err(get_err)?,
        assignments: StaffAssignments {
            reviewer_id: reviewer.map(UserId::from_uuid),
            auditor_id: auditor.map(UserId::from_uuid),
            approver_id: approver.map(UserId::from_uuid),
        },
        certificate_number: row.try_get("certificate_number").map_err(get_err)?,
        document_id: row.try_get("document_id").map_err(get_err)?,
        version: row.try_get("version").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

/// Bind-ready form of a nullable column change: `(set?, value)`.
fn nullable_uuid(change: Option<Option<UserId>>) -> (bool, Option<Uuid>) {
    match change {
        Some(value) => (true, value.map(|id| *id.as_uuid())),
        None => (false, None),
    }
}

impl PostgresRelationalTx {
    async fn insert(&mut self, row: &ApplicationRow) -> Result<(), WorkflowError> {
        sqlx::query(
            r"
            INSERT INTO applications
                (id, code, user_id, product_id, status, stage, completeness_score,
                 rejection_count, total_payments, reviewer_id, auditor_id, approver_id,
                 certificate_number, document_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(row.id.as_uuid())
        .bind(&row.code)
        .bind(row.user_id.as_uuid())
        .bind(row.product_id.as_uuid())
        .bind(row.status.as_str())
        .bind(row.stage.as_str())
        .bind(i16::from(row.completeness_score))
        .bind(i32::try_from(row.rejection_count).unwrap_or(i32::MAX))
        .bind(row.total_payments)
        .bind(row.assignments.reviewer_id.map(|id| *id.as_uuid()))
        .bind(row.assignments.auditor_id.map(|id| *id.as_uuid()))
        .bind(row.assignments.approver_id.map(|id| *id.as_uuid()))
        .bind(&row.certificate_number)
        .bind(&row.document_id)
        .bind(row.version)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error(STORE, "Failed to insert application", &e))?;

        Ok(())
    }

    async fn update(
        &mut self,
        id: ApplicationId,
        expected_version: i64,
        patch: &RowPatch,
    ) -> Result<(), WorkflowError> {
        let (set_reviewer, reviewer) = nullable_uuid(patch.reviewer_id);
        let (set_auditor, auditor) = nullable_uuid(patch.auditor_id);
        let (set_approver, approver) = nullable_uuid(patch.approver_id);
        let (set_certificate, certificate) = match &patch.certificate_number {
            Some(value) => (true, value.clone()),
            None => (false, None),
        };

        let result = sqlx::query(
            r"
            UPDATE applications SET
                status = COALESCE($3, status),
                stage = COALESCE($4, stage),
                completeness_score = COALESCE($5, completeness_score),
                rejection_count = COALESCE($6, rejection_count),
                total_payments = COALESCE($7, total_payments),
                reviewer_id = CASE WHEN $8 THEN $9 ELSE reviewer_id END,
                auditor_id = CASE WHEN $10 THEN $11 ELSE auditor_id END,
                approver_id = CASE WHEN $12 THEN $13 ELSE approver_id END,
                certificate_number = CASE WHEN $14 THEN $15 ELSE certificate_number END,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            ",
        )
        .bind(id.as_uuid())
        .bind(expected_version)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.stage.map(|s| s.as_str()))
        .bind(patch.completeness_score.map(i16::from))
        .bind(patch.rejection_count.map(|c| i32::try_from(c).unwrap_or(i32::MAX)))
        .bind(patch.total_payments)
        .bind(set_reviewer)
        .bind(reviewer)
        .bind(set_auditor)
        .bind(auditor)
        .bind(set_approver)
        .bind(approver)
        .bind(set_certificate)
        .bind(certificate)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error(STORE, "Failed to update application", &e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM applications WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| db_error(STORE, "Failed to read application version", &e))?;

        match actual {
            None => Err(WorkflowError::application_not_found(id)),
            Some(actual) => Err(ConflictError::ConcurrentModification {
                id,
                expected: expected_version,
                actual: Some(actual),
            }
            .into()),
        }
    }

    async fn delete(&mut self, id: ApplicationId) -> Result<(), WorkflowError> {
        sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error(STORE, "Failed to delete application", &e))?;
        Ok(())
    }
}

impl RelationalTransaction for PostgresRelationalTx {
    async fn apply(&mut self, op: &RelationalOp) -> Result<(), WorkflowError> {
        let threshold = self.slow_threshold;
        match op {
            RelationalOp::InsertApplication { row } => {
                observe(STORE, threshold, || format!("{op:?}"), self.insert(row)).await
            }
            RelationalOp::UpdateApplication {
                id,
                expected_version,
                patch,
                ..
            } => {
                observe(
                    STORE,
                    threshold,
                    || format!("{op:?}"),
                    self.update(*id, *expected_version, patch),
                )
                .await
            }
            RelationalOp::DeleteApplication { id } => {
                observe(STORE, threshold, || format!("{op:?}"), self.delete(*id)).await
            }
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error(STORE, "Failed to commit", &e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error(STORE, "Failed to roll back", &e))
    }
}

/// Filter columns shared by search and stats.
struct CommonFilter<'a> {
    user_id: Option<UserId>,
    product_id: Option<ProductId>,
    created_from: Option<DateTime<Utc>>,
    created_to: Option<DateTime<Utc>>,
    search: Option<&'a SearchFilter>,
}

impl<'a> From<&'a SearchFilter> for CommonFilter<'a> {
    fn from(filter: &'a SearchFilter) -> Self {
        Self {
            user_id: filter.user_id,
            product_id: filter.product_id,
            created_from: filter.created_from,
            created_to: filter.created_to,
            search: Some(filter),
        }
    }
}

impl From<&StatsFilter> for CommonFilter<'_> {
    fn from(filter: &StatsFilter) -> Self {
        Self {
            user_id: filter.user_id,
            product_id: filter.product_id,
            created_from: filter.created_from,
            created_to: filter.created_to,
            search: None,
        }
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &CommonFilter<'_>) {
    builder.push(" WHERE TRUE");

    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(*user_id.as_uuid());
    }
    if let Some(product_id) = filter.product_id {
        builder.push(" AND product_id = ").push_bind(*product_id.as_uuid());
    }
    if let Some(from) = filter.created_from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        builder.push(" AND created_at < ").push_bind(to);
    }

    let Some(search) = filter.search else {
        return;
    };
    if let Some(status) = search.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(stage) = search.stage {
        builder.push(" AND stage = ").push_bind(stage.as_str());
    }
    if let Some(staff) = search.assigned_to {
        let staff = *staff.as_uuid();
        builder
            .push(" AND (reviewer_id = ")
            .push_bind(staff)
            .push(" OR auditor_id = ")
            .push_bind(staff)
            .push(" OR approver_id = ")
            .push_bind(staff)
            .push(")");
    }
    if let Some(ids) = &search.ids {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        builder.push(" AND id = ANY(").push_bind(ids).push(")");
    }
}

impl RelationalStore for PostgresRelationalStore {
    type Tx = PostgresRelationalTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error(STORE, "Failed to begin transaction", &e))?;
        Ok(PostgresRelationalTx {
            tx,
            slow_threshold: self.slow_threshold,
        })
    }

    async fn fetch_application(
        &self,
        id: ApplicationId,
    ) -> Result<Option<ApplicationRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM applications WHERE id = $1");
        let row = observe(
            STORE,
            self.slow_threshold,
            || sql.to_owned(),
            sqlx::query(&sql).bind(id.as_uuid()).fetch_optional(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to fetch application", &e))?;

        row.as_ref().map(row_to_application).transpose()
    }

    async fn search(&self, filter: &SearchFilter, page: Pagination) -> Result<RowPage, StoreError> {
        let common = CommonFilter::from(filter);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM applications");
        push_filters(&mut count, &common);
        let count_sql = count.sql().to_owned();
        let total: i64 = observe(
            STORE,
            self.slow_threshold,
            || count_sql.clone(),
            count.build_query_scalar().fetch_one(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to count applications", &e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM applications"));
        push_filters(&mut select, &common);
        select
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(i64::from(page.per_page))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));

        let select_sql = select.sql().to_owned();
        let rows = observe(
            STORE,
            self.slow_threshold,
            || select_sql.clone(),
            select.build().fetch_all(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to search applications", &e))?;

        Ok(RowPage {
            rows: rows
                .iter()
                .map(row_to_application)
                .collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<ApplicationStats, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT status, stage, COUNT(*) AS count, \
             COALESCE(SUM(total_payments), 0)::BIGINT AS payments, \
             COALESCE(SUM(completeness_score), 0)::BIGINT AS completeness \
             FROM applications",
        );
        push_filters(&mut query, &CommonFilter::from(filter));
        query.push(" GROUP BY status, stage");

        let sql = query.sql().to_owned();
        let rows = observe(
            STORE,
            self.slow_threshold,
            || sql.to_owned(),
            query.build().fetch_all(&self.pool),
        )
        .await
        .map_err(|e| db_error(STORE, "Failed to aggregate applications", &e))?;

        let mut stats = ApplicationStats::default();
        let mut completeness_sum: i64 = 0;
        for row in &rows {
            let get_err = |e: sqlx::Error| db_error(STORE, "Failed to decode stats row", &e);
            let status: String = row.try_get("status").map_err(get_err)?;
            let stage: String = row.try_get("stage").map_err(get_err)?;
            let count: i64 = row.try_get("count").map_err(get_err)?;
            let count = u64::try_from(count).unwrap_or(0);

            *stats.by_status.entry(status).or_default() += count;
            *stats.by_stage.entry(stage).or_default() += count;
            stats.total += count;
            stats.total_payments += row.try_get::<i64, _>("payments").map_err(get_err)?;
            completeness_sum += row.try_get::<i64, _>("completeness").map_err(get_err)?;
        }

        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)] // Counts stay far below 2^52
            let average = completeness_sum as f64 / stats.total as f64;
            stats.average_completeness = average;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nullable_changes_distinguish_clear_from_untouched() {
        let staff = UserId::new();
        assert_eq!(nullable_uuid(None), (false, None));
        assert_eq!(nullable_uuid(Some(None)), (true, None));
        assert_eq!(nullable_uuid(Some(Some(staff))), (true, Some(*staff.as_uuid())));
    }

    #[test]
    fn search_filters_render_in_order() {
        let filter = SearchFilter {
            status: Some(ApplicationStatus::Reviewing),
            assigned_to: Some(UserId::new()),
            ids: Some(vec![ApplicationId::new()]),
            ..SearchFilter::default()
        };
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM applications");
        push_filters(&mut builder, &CommonFilter::from(&filter));

        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM applications WHERE TRUE AND status = $1 \
             AND (reviewer_id = $2 OR auditor_id = $3 OR approver_id = $4) AND id = ANY($5)"
        );
    }

    #[test]
    fn stats_filters_ignore_search_only_columns() {
        let filter = StatsFilter {
            user_id: Some(UserId::new()),
            ..StatsFilter::default()
        };
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM applications");
        push_filters(&mut builder, &CommonFilter::from(&filter));
        assert_eq!(builder.sql(), "SELECT 1 FROM applications WHERE TRUE AND user_id = $1");
    }
}
