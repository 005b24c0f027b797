//! Error taxonomy for workflow and persistence operations.

use crate::capability::{Action, Role};
use crate::collaborators::CollaboratorError;
use crate::ids::{ApplicationId, TransactionId};
use crate::payment::PaymentReason;
use crate::store::StoreOp;
use crate::workflow::ApplicationStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Which backend a [`StoreError`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Authoritative relational store
    Relational,
    /// Document store holding form data and sub-records
    Document,
    /// Best-effort cache
    Cache,
    /// Durable saga log
    SagaLog,
}

impl StoreKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
            Self::Cache => "cache",
            Self::SagaLog => "saga_log",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend failure (connection, timeout, query, serialization).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Failing backend
    pub store: StoreKind,
    /// Zero-based index of the failing saga step, when raised inside a saga
    pub step: Option<usize>,
    /// Description of the failing operation, when known
    pub operation: Option<String>,
    /// Backend error message
    pub cause: String,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} store error", self.store)?;
        if let Some(step) = self.step {
            write!(f, " at step {step}")?;
        }
        write!(f, ": {}", self.cause)
    }
}

impl StoreError {
    /// Create a store error outside of any saga.
    #[must_use]
    pub fn new(store: StoreKind, cause: impl Into<String>) -> Self {
        Self {
            store,
            step: None,
            operation: None,
            cause: cause.into(),
        }
    }

    /// Identify the saga step that raised this error.
    #[must_use]
    pub fn at_step(mut self, step: usize, operation: impl Into<String>) -> Self {
        self.step = Some(step);
        self.operation = Some(operation.into());
        self
    }
}

/// A precondition on the application's state was not met.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// The edge is not in the transition table.
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current status
        from: ApplicationStatus,
        /// Requested status
        to: ApplicationStatus,
    },

    /// The transition is gated on a payment that has not completed.
    #[error("Payment required: {reason} ({amount})")]
    PaymentRequired {
        /// Required payment reason
        reason: PaymentReason,
        /// Amount due
        amount: i64,
    },

    /// Completeness score below the submission threshold.
    #[error("Application incomplete: score {score} below threshold {threshold}")]
    Incomplete {
        /// Current score (0-100)
        score: u8,
        /// Required score
        threshold: u8,
        /// Fields that are still missing
        missing: Vec<String>,
    },

    /// Another writer changed the application first.
    #[error("Concurrent modification of application {id}: expected version {expected}")]
    ConcurrentModification {
        /// Application
        id: ApplicationId,
        /// Version the writer read
        expected: i64,
        /// Version found in the store, if the row still exists
        actual: Option<i64>,
    },

    /// The application is closed.
    #[error("Application is in terminal state {status}")]
    TerminalState {
        /// Terminal status
        status: ApplicationStatus,
    },

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while application is {status}")]
    InvalidState {
        /// Requested operation
        operation: String,
        /// Current status
        status: ApplicationStatus,
    },
}

/// A saga committed in one store and failed to commit in the other.
///
/// Never retried automatically. Carries everything needed for reconciliation.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Partial commit of transaction {transaction_id}: {committed} committed, {failed} failed: {cause}")]
pub struct PartialCommitError {
    /// Saga transaction id
    pub transaction_id: TransactionId,
    /// Store whose commit succeeded
    pub committed: StoreKind,
    /// Store whose commit failed
    pub failed: StoreKind,
    /// Commit failure message
    pub cause: String,
    /// Full operation list of the saga
    pub operations: Vec<StoreOp>,
}

/// Top-level error for every service operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkflowError {
    // ═══════════════════════════════════════════════════════════
    // Caller errors
    // ═══════════════════════════════════════════════════════════

    /// Malformed input, rejected before any store access.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// Actor lacks the capability for this action on this entity.
    #[error("{role} may not {action}: {reason}")]
    Authorization {
        /// Actor role
        role: Role,
        /// Requested action
        action: Action,
        /// Failed rule
        reason: String,
    },

    /// Workflow precondition failed.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    // ═══════════════════════════════════════════════════════════
    // Backend errors
    // ═══════════════════════════════════════════════════════════

    /// Backend failure; any saga in flight was rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Saga left the stores inconsistent.
    #[error(transparent)]
    PartialCommit(Box<PartialCommitError>),

    /// An external collaborator (certificate service) failed.
    #[error(transparent)]
    External(#[from] CollaboratorError),
}

impl From<PartialCommitError> for WorkflowError {
    fn from(err: PartialCommitError) -> Self {
        Self::PartialCommit(Box::new(err))
    }
}

impl WorkflowError {
    /// Shorthand for [`WorkflowError::NotFound`] on an application.
    #[must_use]
    pub fn application_not_found(id: ApplicationId) -> Self {
        Self::NotFound {
            entity: "application",
            id: id.to_string(),
        }
    }

    /// Discriminable kind for API layers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Authorization { .. } => "authorization",
            Self::Conflict(_) => "conflict",
            Self::Store(_) => "store",
            Self::PartialCommit(_) => "partial_commit",
            Self::External(_) => "external",
        }
    }

    /// Tag a store error with the saga step that raised it. Other errors
    /// pass through unchanged.
    #[must_use]
    pub fn at_step(self, step: usize, operation: impl Into<String>) -> Self {
        match self {
            Self::Store(err) => Self::Store(err.at_step(step, operation)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_names_failing_step() {
        let err = StoreError::new(StoreKind::Document, "timeout").at_step(2, "push paymentHistory");
        assert_eq!(err.to_string(), "document store error at step 2: timeout");
        assert_eq!(err.operation.as_deref(), Some("push paymentHistory"));
    }

    #[test]
    fn kinds_are_discriminable() {
        let conflict: WorkflowError = ConflictError::PaymentRequired {
            reason: PaymentReason::ThirdReview,
            amount: 5_000,
        }
        .into();
        assert_eq!(conflict.kind(), "conflict");
        assert_eq!(conflict.to_string(), "Payment required: 3rd_review (5000)");
        assert_eq!(WorkflowError::Validation("x".into()).kind(), "validation");
    }

    #[test]
    fn at_step_leaves_conflicts_untouched() {
        let err = WorkflowError::Conflict(ConflictError::TerminalState {
            status: ApplicationStatus::Cancelled,
        });
        assert_eq!(err.clone().at_step(0, "op"), err);
    }
}
