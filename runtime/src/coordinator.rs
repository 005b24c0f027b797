//! Saga coordinator spanning the relational and document stores.
//!
//! # Protocol
//!
//! 1. Record the saga in the log (`started`)
//! 2. Open one transaction per store
//! 3. Apply operations in order, routed by store tag
//! 4. Any failure rolls back both transactions (`rolled_back`)
//! 5. Otherwise mark `committing`, commit relational, commit documents
//! 6. Mark `completed`
//!
//! A document commit failure after the relational commit is a partial
//! commit. It is logged at the highest severity, recorded in the saga log and
//! returned as [`PartialCommitError`]. It is never retried here; see
//! [`Coordinator::reconcile`].

use crate::metrics::SagaMetrics;
use certflow_core::environment::Clock;
use certflow_core::error::{PartialCommitError, StoreError, StoreKind, WorkflowError};
use certflow_core::ids::{TransactionId, UserId};
use certflow_core::saga::{PhaseUpdate, SagaEntry, SagaLog, SagaPhase, SagaPlan, SagaReceipt};
use certflow_core::store::{
    DocumentStore, DocumentTransaction, RelationalStore, RelationalTransaction, StoreOp,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Sagas fixed up by [`Coordinator::recover_interrupted`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// `started` sagas marked `rolled_back`
    pub rolled_back: Vec<TransactionId>,
    /// `committing` sagas escalated to `partial_commit`
    pub escalated: Vec<TransactionId>,
}

/// Largest batch read from the saga log during recovery.
const RECOVERY_BATCH: i64 = 500;

/// Applies [`SagaPlan`]s across both stores.
pub struct Coordinator<R, D> {
    relational: Arc<R>,
    documents: Arc<D>,
    saga_log: Arc<dyn SagaLog>,
    clock: Arc<dyn Clock>,
}

impl<R, D> Clone for Coordinator<R, D> {
    fn clone(&self) -> Self {
        Self {
            relational: Arc::clone(&self.relational),
            documents: Arc::clone(&self.documents),
            saga_log: Arc::clone(&self.saga_log),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<R: RelationalStore, D: DocumentStore> Coordinator<R, D> {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        relational: Arc<R>,
        documents: Arc<D>,
        saga_log: Arc<dyn SagaLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            relational,
            documents,
            saga_log,
            clock,
        }
    }

    /// Relational store.
    #[must_use]
    pub fn relational(&self) -> &R {
        &self.relational
    }

    /// Document store.
    #[must_use]
    pub fn documents(&self) -> &D {
        &self.documents
    }

    /// Saga log.
    #[must_use]
    pub fn saga_log(&self) -> &dyn SagaLog {
        self.saga_log.as_ref()
    }

    /// Apply `plan` atomically across both stores.
    ///
    /// # Errors
    ///
    /// - The failing step's error, tagged with its index, after both
    ///   transactions were rolled back
    /// - [`WorkflowError::Store`] if the saga log or a commit failed before
    ///   anything was committed
    /// - [`WorkflowError::PartialCommit`] if relational committed and
    ///   documents did not
    #[tracing::instrument(skip(self, plan), fields(saga = %plan.label, operations = plan.operations.len()))]
    pub async fn execute(&self, plan: SagaPlan) -> Result<SagaReceipt, WorkflowError> {
        let started = Instant::now();
        let transaction_id = TransactionId::new();
        let operation_count = plan.operations.len();

        self.saga_log
            .record(SagaEntry::started(transaction_id, &plan, self.clock.now()))
            .await?;
        SagaMetrics::record_started();
        tracing::debug!(%transaction_id, "Saga started");

        let mut relational_tx = match self.relational.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.mark_rolled_back(transaction_id, None, &e.to_string(), started)
                    .await;
                return Err(e.into());
            }
        };
        let mut document_tx = match self.documents.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                rollback_relational(relational_tx).await;
                self.mark_rolled_back(transaction_id, None, &e.to_string(), started)
                    .await;
                return Err(e.into());
            }
        };

        for (step, op) in plan.operations.iter().enumerate() {
            let applied = match op {
                StoreOp::Relational(op) => relational_tx.apply(op).await,
                StoreOp::Document(op) => document_tx.apply(op).await,
            };
            if let Err(e) = applied {
                let err = e.at_step(step, op.describe());
                tracing::error!(
                    %transaction_id,
                    step = step,
                    operation = %op.describe(),
                    error = %err,
                    "Saga step failed, rolling back"
                );
                rollback_relational(relational_tx).await;
                rollback_documents(document_tx).await;
                self.mark_rolled_back(transaction_id, Some(step), &err.to_string(), started)
                    .await;
                return Err(err);
            }
        }

        if let Err(e) = self
            .saga_log
            .update_phase(
                transaction_id,
                PhaseUpdate::to(SagaPhase::Committing, self.clock.now()),
            )
            .await
        {
            tracing::error!(%transaction_id, error = %e, "Failed to mark saga committing, rolling back");
            rollback_relational(relational_tx).await;
            rollback_documents(document_tx).await;
            self.mark_rolled_back(transaction_id, None, &e.to_string(), started)
                .await;
            return Err(e.into());
        }

        // No I/O between the two commit calls
        if let Err(e) = relational_tx.commit().await {
            tracing::error!(%transaction_id, error = %e, "Relational commit failed, rolling back documents");
            rollback_documents(document_tx).await;
            self.mark_rolled_back(transaction_id, None, &e.to_string(), started)
                .await;
            return Err(e.into());
        }
        if let Err(e) = document_tx.commit().await {
            return Err(self
                .partial_commit(transaction_id, plan, &e)
                .await
                .into());
        }

        if let Err(e) = self
            .saga_log
            .update_phase(
                transaction_id,
                PhaseUpdate::to(SagaPhase::Completed, self.clock.now()),
            )
            .await
        {
            // Both stores committed; the entry stays in `committing`
            tracing::error!(%transaction_id, error = %e, "Failed to mark saga completed");
        }
        SagaMetrics::record_completed(started.elapsed());
        tracing::debug!(%transaction_id, "Saga completed");

        Ok(SagaReceipt {
            transaction_id,
            operations: operation_count,
        })
    }

    async fn partial_commit(
        &self,
        transaction_id: TransactionId,
        plan: SagaPlan,
        cause: &StoreError,
    ) -> PartialCommitError {
        let operations = serde_json::to_string(&plan.operations).unwrap_or_default();
        tracing::error!(
            severity = "CRITICAL",
            %transaction_id,
            saga = %plan.label,
            committed = StoreKind::Relational.as_str(),
            failed = StoreKind::Document.as_str(),
            error = %cause,
            operations = %operations,
            "Partial commit: relational committed, document commit failed"
        );
        SagaMetrics::record_partial_commit();

        if let Err(e) = self
            .saga_log
            .update_phase(
                transaction_id,
                PhaseUpdate::failed(
                    SagaPhase::PartialCommit,
                    None,
                    cause.to_string(),
                    self.clock.now(),
                ),
            )
            .await
        {
            tracing::error!(
                severity = "CRITICAL",
                %transaction_id,
                error = %e,
                "Failed to record partial commit in the saga log"
            );
        }

        PartialCommitError {
            transaction_id,
            committed: StoreKind::Relational,
            failed: StoreKind::Document,
            cause: cause.to_string(),
            operations: plan.operations,
        }
    }

    async fn mark_rolled_back(
        &self,
        transaction_id: TransactionId,
        step: Option<usize>,
        error: &str,
        started: Instant,
    ) {
        SagaMetrics::record_rolled_back(started.elapsed());
        if let Err(e) = self
            .saga_log
            .update_phase(
                transaction_id,
                PhaseUpdate::failed(SagaPhase::RolledBack, step, error, self.clock.now()),
            )
            .await
        {
            tracing::warn!(%transaction_id, error = %e, "Failed to mark saga rolled back");
        }
    }

    /// Undo the relational half of a partially committed saga.
    ///
    /// Applies the compensations of the relational operations in reverse
    /// order inside one fresh transaction, then marks the saga `compensated`.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown transaction id
    /// - [`WorkflowError::Validation`] if the saga is not in `partial_commit`
    /// - The compensation's error (for example a concurrent modification
    ///   when the row changed since) after rolling back
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, transaction_id: TransactionId) -> Result<SagaReceipt, WorkflowError> {
        let entry = self
            .saga_log
            .get(transaction_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                entity: "saga",
                id: transaction_id.to_string(),
            })?;
        if entry.phase != SagaPhase::PartialCommit {
            return Err(WorkflowError::Validation(format!(
                "saga {transaction_id} is {}, only partial commits can be reconciled",
                entry.phase
            )));
        }

        let compensations: Vec<_> = entry
            .operations
            .iter()
            .rev()
            .filter(|op| op.store() == StoreKind::Relational)
            .filter_map(StoreOp::compensation)
            .collect();

        let mut tx = self.relational.begin().await?;
        for (step, op) in compensations.iter().enumerate() {
            let StoreOp::Relational(relational_op) = op else {
                continue;
            };
            if let Err(e) = tx.apply(relational_op).await {
                rollback_relational(tx).await;
                let err = e.at_step(step, op.describe());
                tracing::error!(%transaction_id, error = %err, "Compensation failed");
                return Err(err);
            }
        }
        tx.commit().await?;

        self.saga_log
            .update_phase(
                transaction_id,
                PhaseUpdate::to(SagaPhase::Compensated, self.clock.now()),
            )
            .await?;
        SagaMetrics::record_compensated();
        tracing::info!(
            %transaction_id,
            compensations = compensations.len(),
            "Partial commit compensated"
        );

        Ok(SagaReceipt {
            transaction_id,
            operations: compensations.len(),
        })
    }

    /// Settle sagas interrupted by a crash.
    ///
    /// Sagas in `started` committed nothing and become `rolled_back`. Sagas in
    /// `committing` may have committed the relational half and are escalated
    /// to `partial_commit`. Only sagas idle for longer than `older_than` are
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Store`] if the saga log cannot be read or
    /// written.
    #[tracing::instrument(skip(self))]
    pub async fn recover_interrupted(
        &self,
        older_than: chrono::Duration,
    ) -> Result<RecoveryReport, WorkflowError> {
        let now = self.clock.now();
        let cutoff = now - older_than;
        let mut report = RecoveryReport::default();

        for entry in self
            .saga_log
            .list_by_phase(SagaPhase::Started, Some(cutoff), RECOVERY_BATCH)
            .await?
        {
            self.saga_log
                .update_phase(
                    entry.transaction_id,
                    PhaseUpdate::failed(
                        SagaPhase::RolledBack,
                        None,
                        "interrupted before commit",
                        now,
                    ),
                )
                .await?;
            tracing::warn!(transaction_id = %entry.transaction_id, saga = %entry.label, "Interrupted saga rolled back");
            report.rolled_back.push(entry.transaction_id);
        }

        for entry in self
            .saga_log
            .list_by_phase(SagaPhase::Committing, Some(cutoff), RECOVERY_BATCH)
            .await?
        {
            self.saga_log
                .update_phase(
                    entry.transaction_id,
                    PhaseUpdate::failed(
                        SagaPhase::PartialCommit,
                        None,
                        "interrupted during commit",
                        now,
                    ),
                )
                .await?;
            let operations = serde_json::to_string(&entry.operations).unwrap_or_default();
            tracing::error!(
                severity = "CRITICAL",
                transaction_id = %entry.transaction_id,
                saga = %entry.label,
                operations = %operations,
                "Saga interrupted during commit, escalated to partial commit"
            );
            SagaMetrics::record_partial_commit();
            report.escalated.push(entry.transaction_id);
        }

        tracing::info!(
            rolled_back = report.rolled_back.len(),
            escalated = report.escalated.len(),
            "Saga recovery finished"
        );
        Ok(report)
    }

    /// Close a saga manually.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown transaction id
    /// - [`WorkflowError::Validation`] if the saga already reached a final
    ///   phase
    pub async fn mark_resolved(
        &self,
        transaction_id: TransactionId,
        resolved_by: UserId,
        notes: Option<String>,
    ) -> Result<(), WorkflowError> {
        let entry = self
            .saga_log
            .get(transaction_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                entity: "saga",
                id: transaction_id.to_string(),
            })?;
        if entry.phase.is_final() {
            return Err(WorkflowError::Validation(format!(
                "saga {transaction_id} is already {}",
                entry.phase
            )));
        }
        self.saga_log
            .mark_resolved(transaction_id, resolved_by, notes, self.clock.now())
            .await?;
        tracing::info!(%transaction_id, %resolved_by, "Saga resolved manually");
        Ok(())
    }

    /// Partially committed sagas awaiting reconciliation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Store`] if the saga log cannot be read.
    pub async fn unresolved(&self, limit: i64) -> Result<Vec<SagaEntry>, WorkflowError> {
        Ok(self
            .saga_log
            .list_by_phase(SagaPhase::PartialCommit, None, limit)
            .await?)
    }
}

async fn rollback_relational<T: RelationalTransaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Relational rollback failed");
    }
}

async fn rollback_documents<T: DocumentTransaction>(tx: T) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Document rollback failed");
    }
}
