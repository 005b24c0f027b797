//! Saga plans and the durable saga log.
//!
//! A saga is an ordered list of store-tagged operations applied across the
//! relational and document stores. Each phase change is written to the saga
//! log so a crash mid-saga can be recovered and a partial commit reconciled.

use crate::error::StoreError;
use crate::ids::{TransactionId, UserId};
use crate::store::{DocumentOp, RelationalOp, StoreOp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Phase of a saga in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPhase {
    /// Transactions open, operations being applied
    Started,
    /// All operations applied, commit calls in progress
    Committing,
    /// Both stores committed
    Completed,
    /// Neither store committed
    RolledBack,
    /// Relational committed, documents did not
    PartialCommit,
    /// Partial commit undone by compensations
    Compensated,
    /// Partial commit closed manually
    Resolved,
}

impl SagaPhase {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::PartialCommit => "partial_commit",
            Self::Compensated => "compensated",
            Self::Resolved => "resolved",
        }
    }

    /// No further phase change is expected.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::RolledBack | Self::Compensated | Self::Resolved
        )
    }
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "committing" => Ok(Self::Committing),
            "completed" => Ok(Self::Completed),
            "rolled_back" => Ok(Self::RolledBack),
            "partial_commit" => Ok(Self::PartialCommit),
            "compensated" => Ok(Self::Compensated),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid saga phase: {s}")),
        }
    }
}

/// Ordered operations to apply atomically across both stores.
#[derive(Clone, Debug, PartialEq)]
pub struct SagaPlan {
    /// Short name of the business operation (`submit`, `record_payment`, ...)
    pub label: String,
    /// Operations in application order
    pub operations: Vec<StoreOp>,
}

impl SagaPlan {
    /// Empty plan.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            operations: Vec::new(),
        }
    }

    /// Append a relational step.
    #[must_use]
    pub fn relational(mut self, op: RelationalOp) -> Self {
        self.operations.push(StoreOp::Relational(op));
        self
    }

    /// Append a document step.
    #[must_use]
    pub fn document(mut self, op: DocumentOp) -> Self {
        self.operations.push(StoreOp::Document(op));
        self
    }

    /// Append several document steps.
    #[must_use]
    pub fn documents(mut self, ops: impl IntoIterator<Item = DocumentOp>) -> Self {
        self.operations.extend(ops.into_iter().map(StoreOp::Document));
        self
    }

    /// Append a step of either kind.
    pub fn push(&mut self, op: StoreOp) {
        self.operations.push(op);
    }

    /// Whether the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Successful saga outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaReceipt {
    /// Saga transaction id
    pub transaction_id: TransactionId,
    /// Number of operations applied
    pub operations: usize,
}

/// One saga in the durable log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaEntry {
    /// Saga transaction id
    pub transaction_id: TransactionId,
    /// Business operation name
    pub label: String,
    /// Current phase
    pub phase: SagaPhase,
    /// Full operation list
    pub operations: Vec<StoreOp>,
    /// Index of the failing step, if a step failed
    pub failed_step: Option<usize>,
    /// Last error message
    pub error: Option<String>,
    /// Who closed the saga manually
    pub resolved_by: Option<UserId>,
    /// Resolution notes
    pub resolution_notes: Option<String>,
    /// When the saga started
    pub created_at: DateTime<Utc>,
    /// Last phase change
    pub updated_at: DateTime<Utc>,
}

impl SagaEntry {
    /// New entry in phase `started`.
    #[must_use]
    pub fn started(
        transaction_id: TransactionId,
        plan: &SagaPlan,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            label: plan.label.clone(),
            phase: SagaPhase::Started,
            operations: plan.operations.clone(),
            failed_step: None,
            error: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Phase change written to the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseUpdate {
    /// New phase
    pub phase: SagaPhase,
    /// Failing step, if any
    pub failed_step: Option<usize>,
    /// Error message, if any
    pub error: Option<String>,
    /// When the change happened
    pub at: DateTime<Utc>,
}

impl PhaseUpdate {
    /// Phase change without failure details.
    #[must_use]
    pub const fn to(phase: SagaPhase, at: DateTime<Utc>) -> Self {
        Self {
            phase,
            failed_step: None,
            error: None,
            at,
        }
    }

    /// Phase change carrying a failure.
    #[must_use]
    pub fn failed(
        phase: SagaPhase,
        failed_step: Option<usize>,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            phase,
            failed_step,
            error: Some(error.into()),
            at,
        }
    }
}

/// Durable log of saga phases.
///
/// This trait is dyn-compatible so the coordinator can hold any backend
/// behind an `Arc<dyn SagaLog>`.
pub trait SagaLog: Send + Sync {
    /// Record a new saga.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the entry could not be written.
    fn record(
        &self,
        entry: SagaEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Move a saga to a new phase.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update failed or the saga is unknown.
    fn update_phase(
        &self,
        transaction_id: TransactionId,
        update: PhaseUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Read one saga.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaEntry>, StoreError>> + Send + '_>>;

    /// Sagas in `phase` last updated before `older_than`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn list_by_phase(
        &self,
        phase: SagaPhase,
        older_than: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SagaEntry>, StoreError>> + Send + '_>>;

    /// Close a saga manually.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update failed or the saga is unknown.
    fn mark_resolved(
        &self,
        transaction_id: TransactionId,
        resolved_by: UserId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
