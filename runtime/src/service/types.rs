//! Inputs and results of [`ApplicationService`](super::ApplicationService)
//! operations.

use certflow_core::ids::ApplicationId;
use certflow_core::payment::PaymentReason;
use certflow_core::records::{ApprovalDecision, AuditResult, ReviewStatus};
use certflow_core::workflow::ApplicationStatus;
use serde::{Deserialize, Serialize};

/// Result of `create_application`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApplication {
    /// New application id
    pub id: ApplicationId,
    /// Immutable application code
    pub code: String,
    /// Always `draft`
    pub status: ApplicationStatus,
}

/// Result of `update_application`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedFields {
    /// Application
    pub id: ApplicationId,
    /// Form fields whose value changed
    pub updated_fields: Vec<String>,
    /// Completeness after the update
    pub completeness_score: u8,
}

/// Result of `submit_application`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    /// Status after submission
    pub status: ApplicationStatus,
    /// What the applicant should do next
    pub next_steps: Vec<String>,
}

/// Result of `can_proceed_to_next_stage`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceedCheck {
    /// Current status
    pub current: ApplicationStatus,
    /// Happy-path next status
    pub next: Option<ApplicationStatus>,
    /// Whether that transition would be accepted now
    pub can_proceed: bool,
    /// Why not, when it would be refused
    pub reason: Option<String>,
}

/// A payment attempt reported by the applicant or the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInput {
    /// What the payment is for
    pub reason: PaymentReason,
    /// Amount in minor units; must match the fee schedule
    pub amount: i64,
    /// Payment method label
    #[serde(default)]
    pub method: Option<String>,
    /// Gateway reference, if already known
    #[serde(default)]
    pub gateway_reference: Option<String>,
}

/// Gateway verdict on a pending payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Settled
    Completed,
    /// Declined
    Failed,
}

/// A document review.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInput {
    /// Outcome
    pub status: ReviewStatus,
    /// Optional score (0-100)
    #[serde(default)]
    pub score: Option<u8>,
    /// Reviewer comments
    #[serde(default)]
    pub comments: Option<String>,
    /// Individual findings
    #[serde(default)]
    pub findings: Vec<String>,
    /// Close the application (`rejected_final`) instead of allowing a resubmission
    #[serde(default)]
    pub final_rejection: bool,
}

/// An audit result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInput {
    /// Outcome
    pub result: AuditResult,
    /// Optional score (0-100)
    #[serde(default)]
    pub score: Option<u8>,
    /// Individual findings
    #[serde(default)]
    pub findings: Vec<String>,
    /// Auditor comments, copied to the history entry
    #[serde(default)]
    pub comments: Option<String>,
}

/// The approver's decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInput {
    /// Decision
    pub decision: ApprovalDecision,
    /// Comments
    #[serde(default)]
    pub comments: Option<String>,
}

/// An artifact already stored by the file service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInput {
    /// File service id
    pub file_id: String,
    /// Document category
    pub category: String,
    /// Storage path reported by the file service
    pub path: String,
}
