//! In-memory relational store.
//!
//! Transactions stage their writes and publish them on commit. One
//! transaction is open at a time, standing in for the row lock a Postgres
//! update takes: a second writer waits, then finds the new version and
//! fails its conditional update the same way it would against Postgres.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use crate::faults::Faults;
use certflow_core::application::ApplicationRow;
use certflow_core::error::{ConflictError, StoreError, StoreKind, WorkflowError};
use certflow_core::ids::ApplicationId;
use certflow_core::store::{
    ApplicationStats, Pagination, RelationalOp, RelationalStore, RelationalTransaction, RowPage,
    SearchFilter, StatsFilter,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Rows = Arc<Mutex<BTreeMap<ApplicationId, ApplicationRow>>>;

/// `HashMap`-backed relational store with failure injection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRelationalStore {
    rows: Rows,
    writer: Arc<AsyncMutex<()>>,
    faults: Faults,
}

impl InMemoryRelationalStore {
    /// Empty store without injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store sharing a failure switchboard.
    #[must_use]
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            rows: Rows::default(),
            writer: Arc::default(),
            faults,
        }
    }

    /// Committed row, bypassing transactions.
    #[must_use]
    pub fn row(&self, id: ApplicationId) -> Option<ApplicationRow> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Whether no rows are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }

    /// Seed a committed row directly.
    pub fn insert_row(&self, row: ApplicationRow) {
        self.rows.lock().unwrap().insert(row.id, row);
    }
}

/// Staged relational transaction.
#[derive(Debug)]
pub struct InMemoryRelationalTx {
    rows: Rows,
    _writer: OwnedMutexGuard<()>,
    faults: Faults,
    staged: BTreeMap<ApplicationId, Option<ApplicationRow>>,
    read_versions: BTreeMap<ApplicationId, Option<i64>>,
}

impl InMemoryRelationalTx {
    fn current(&mut self, id: ApplicationId) -> Option<ApplicationRow> {
        if let Some(staged) = self.staged.get(&id) {
            return staged.clone();
        }
        let row = self.rows.lock().unwrap().get(&id).cloned();
        self.read_versions
            .entry(id)
            .or_insert_with(|| row.as_ref().map(|r| r.version));
        row
    }

    fn apply_op(&mut self, op: &RelationalOp) -> Result<(), WorkflowError> {
        self.faults.before_apply(StoreKind::Relational)?;

        match op {
            RelationalOp::InsertApplication { row } => {
                if self.current(row.id).is_some() {
                    return Err(StoreError::new(
                        StoreKind::Relational,
                        format!("duplicate key value violates unique constraint: {}", row.id),
                    )
                    .into());
                }
                self.staged.insert(row.id, Some(row.clone()));
            }
            RelationalOp::UpdateApplication {
                id,
                expected_version,
                patch,
                ..
            } => {
                let Some(mut row) = self.current(*id) else {
                    return Err(WorkflowError::application_not_found(*id));
                };
                if row.version != *expected_version {
                    return Err(ConflictError::ConcurrentModification {
                        id: *id,
                        expected: *expected_version,
                        actual: Some(row.version),
                    }
                    .into());
                }
                patch.apply_to(&mut row);
                row.version += 1;
                row.updated_at = Utc::now();
                self.staged.insert(*id, Some(row));
            }
            RelationalOp::DeleteApplication { id } => {
                self.current(*id);
                self.staged.insert(*id, None);
            }
        }
        Ok(())
    }
}

impl RelationalTransaction for InMemoryRelationalTx {
    async fn apply(&mut self, op: &RelationalOp) -> Result<(), WorkflowError> {
        self.apply_op(op)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.faults.before_commit(StoreKind::Relational)?;

        let mut rows = self.rows.lock().unwrap();
        for (id, read_version) in &self.read_versions {
            if rows.get(id).map(|r| r.version) != *read_version {
                return Err(StoreError::new(
                    StoreKind::Relational,
                    "could not serialize access due to concurrent update",
                ));
            }
        }
        for (id, row) in self.staged {
            match row {
                Some(row) => rows.insert(id, row),
                None => rows.remove(&id),
            };
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn matches_search(row: &ApplicationRow, filter: &SearchFilter) -> bool {
    filter.status.is_none_or(|s| row.status == s)
        && filter.stage.is_none_or(|s| row.stage == s)
        && filter.user_id.is_none_or(|u| row.user_id == u)
        && filter.product_id.is_none_or(|p| row.product_id == p)
        && filter.assigned_to.is_none_or(|staff| {
            [
                row.assignments.reviewer_id,
                row.assignments.auditor_id,
                row.assignments.approver_id,
            ]
            .contains(&Some(staff))
        })
        && filter.created_from.is_none_or(|from| row.created_at >= from)
        && filter.created_to.is_none_or(|to| row.created_at < to)
        && filter.ids.as_ref().is_none_or(|ids| ids.contains(&row.id))
}

fn matches_stats(row: &ApplicationRow, filter: &StatsFilter) -> bool {
    filter.user_id.is_none_or(|u| row.user_id == u)
        && filter.product_id.is_none_or(|p| row.product_id == p)
        && filter.created_from.is_none_or(|from| row.created_at >= from)
        && filter.created_to.is_none_or(|to| row.created_at < to)
}

impl RelationalStore for InMemoryRelationalStore {
    type Tx = InMemoryRelationalTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        Ok(InMemoryRelationalTx {
            rows: Arc::clone(&self.rows),
            _writer: writer,
            faults: self.faults.clone(),
            staged: BTreeMap::new(),
            read_versions: BTreeMap::new(),
        })
    }

    async fn fetch_application(&self, id: ApplicationId) -> Result<Option<ApplicationRow>, StoreError> {
        self.faults.before_read().await;
        Ok(self.row(id))
    }

    async fn search(&self, filter: &SearchFilter, page: Pagination) -> Result<RowPage, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| matches_search(row, filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = rows.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(page.per_page as usize)
            .collect();
        Ok(RowPage { rows, total })
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<ApplicationStats, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut stats = ApplicationStats::default();
        let mut completeness_sum = 0u64;

        for row in rows.values().filter(|row| matches_stats(row, filter)) {
            stats.total += 1;
            *stats.by_status.entry(row.status.as_str().to_string()).or_default() += 1;
            *stats.by_stage.entry(row.stage.as_str().to_string()).or_default() += 1;
            stats.total_payments += row.total_payments;
            completeness_sum += u64::from(row.completeness_score);
        }
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let average = completeness_sum as f64 / stats.total as f64;
            stats.average_completeness = average;
        }
        Ok(stats)
    }
}
