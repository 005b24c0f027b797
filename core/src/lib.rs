//! # certflow core
//!
//! Domain model and contracts for the certification workflow.
//!
//! ## Contents
//!
//! - **Application aggregate**: the relational row, the document and their
//!   merged view ([`application`])
//! - **Workflow**: the payment-gated state machine ([`workflow`])
//! - **Capabilities**: the exhaustive Role x Action matrix ([`capability`])
//! - **Store contracts**: typed operations with compensations and the
//!   adapter traits ([`store`], [`saga`])
//! - **Collaborators**: certificate issuing and notifications
//!
//! Everything in this crate is free of I/O; adapters live in
//! `certflow-postgres` and `certflow-redis`, orchestration in
//! `certflow-runtime`.

pub mod application;
pub mod capability;
pub mod collaborators;
pub mod completeness;
pub mod error;
pub mod ids;
pub mod payment;
pub mod records;
pub mod saga;
pub mod store;
pub mod workflow;

pub use application::{Application, ApplicationDocument, ApplicationRow, RowPatch};
pub use capability::{Action, Actor, Role, StaffAssignments, StaffRole};
pub use error::{ConflictError, PartialCommitError, StoreError, StoreKind, WorkflowError};
pub use ids::{ApplicationId, PaymentId, ProductId, RecordId, TransactionId, UserId};
pub use payment::{PaymentReason, PaymentRecord, PaymentRequirement, PaymentStatus, PaymentType};
pub use store::{DocumentOp, RelationalOp, StoreOp};
pub use workflow::{ApplicationStatus, Stage, WorkflowSnapshot};

/// Environment traits for dependency injection.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
