//! In-memory saga log.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use crate::faults::Faults;
use certflow_core::error::{StoreError, StoreKind};
use certflow_core::ids::{TransactionId, UserId};
use certflow_core::saga::{PhaseUpdate, SagaEntry, SagaLog, SagaPhase};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Saga log kept in process memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySagaLog {
    entries: Arc<Mutex<HashMap<TransactionId, SagaEntry>>>,
    faults: Faults,
}

impl InMemorySagaLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty log sharing a failure switchboard.
    #[must_use]
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            entries: Arc::default(),
            faults,
        }
    }

    /// Every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<SagaEntry> {
        let mut entries: Vec<_> = self.entries.lock().unwrap().values().cloned().collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }

    /// Entries currently in `phase`.
    #[must_use]
    pub fn in_phase(&self, phase: SagaPhase) -> Vec<SagaEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.phase == phase)
            .collect()
    }

    /// Seed an entry directly (to simulate a crash mid-saga).
    pub fn insert(&self, entry: SagaEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.transaction_id, entry);
    }

    fn unknown(transaction_id: TransactionId) -> StoreError {
        StoreError::new(
            StoreKind::SagaLog,
            format!("unknown saga {transaction_id}"),
        )
    }
}

impl SagaLog for InMemorySagaLog {
    fn record(
        &self,
        entry: SagaEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check_saga_log()?;
            self.insert(entry);
            Ok(())
        })
    }

    fn update_phase(
        &self,
        transaction_id: TransactionId,
        update: PhaseUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check_saga_log()?;
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&transaction_id)
                .ok_or_else(|| Self::unknown(transaction_id))?;
            entry.phase = update.phase;
            if update.failed_step.is_some() {
                entry.failed_step = update.failed_step;
            }
            if update.error.is_some() {
                entry.error = update.error;
            }
            entry.updated_at = update.at;
            Ok(())
        })
    }

    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaEntry>, StoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.entries.lock().unwrap().get(&transaction_id).cloned()) })
    }

    fn list_by_phase(
        &self,
        phase: SagaPhase,
        older_than: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaEntry>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let limit = usize::try_from(limit).unwrap_or(0);
            Ok(self
                .entries()
                .into_iter()
                .filter(|entry| entry.phase == phase)
                .filter(|entry| older_than.is_none_or(|cutoff| entry.updated_at < cutoff))
                .take(limit)
                .collect())
        })
    }

    fn mark_resolved(
        &self,
        transaction_id: TransactionId,
        resolved_by: UserId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check_saga_log()?;
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&transaction_id)
                .ok_or_else(|| Self::unknown(transaction_id))?;
            entry.phase = SagaPhase::Resolved;
            entry.resolved_by = Some(resolved_by);
            entry.resolution_notes = notes;
            entry.updated_at = at;
            Ok(())
        })
    }
}
