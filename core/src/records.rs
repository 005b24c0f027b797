//! Sub-records stored inside the application document.

use crate::capability::Role;
use crate::ids::{RecordId, UserId};
use crate::workflow::ApplicationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable entry of the workflow audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowHistoryEntry {
    /// State before the transition
    pub from_status: ApplicationStatus,
    /// State after the transition
    pub to_status: ApplicationStatus,
    /// Who performed it
    pub actor_id: UserId,
    /// In which capacity
    pub actor_role: Role,
    /// Operation that caused it (`submit`, `review`, ...)
    pub action: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Free-form comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Extra structured context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Outcome of a document review round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Documents accepted; the application moves to audit
    Approved,
    /// Documents rejected; counts toward `rejection_count`
    Rejected,
}

/// A document review round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    /// Record id
    pub id: RecordId,
    /// 1-based review round
    pub round: u32,
    /// Reviewer
    pub reviewer_id: UserId,
    /// Outcome
    pub status: ReviewStatus,
    /// Optional score (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    /// Reviewer comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Individual findings
    #[serde(default)]
    pub findings: Vec<String>,
    /// When the review was recorded
    pub reviewed_at: DateTime<Utc>,
}

/// Kind of audit performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// First audit after review
    Document,
    /// Paid re-audit after a failure
    ReAudit,
    /// Paid on-site audit after an inconclusive result
    Field,
}

/// Outcome of an audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    /// Audit passed; the application moves to approval
    Passed,
    /// Audit failed; a re-audit fee is due
    Failed,
    /// Audit inconclusive; a field audit fee is due
    Doubt,
}

/// An audit round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Record id
    pub id: RecordId,
    /// 1-based audit round
    pub round: u32,
    /// Auditor
    pub auditor_id: UserId,
    /// Kind of audit
    pub kind: AuditKind,
    /// Outcome
    pub result: AuditResult,
    /// Optional score (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    /// Individual findings
    #[serde(default)]
    pub findings: Vec<String>,
    /// When the audit was recorded
    pub audited_at: DateTime<Utc>,
}

/// Final approval decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Certificate may be issued
    Approved,
    /// Application closed as `rejected_final`
    Rejected,
}

/// The approver's decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// Approver
    pub approver_id: UserId,
    /// Decision
    pub decision: ApprovalDecision,
    /// Comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

/// Reference to an issued certificate. The file itself lives in the
/// certificate service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Human-readable certificate number
    pub certificate_number: String,
    /// Where the rendered certificate is stored
    pub file_path: String,
    /// Issue timestamp
    pub issue_date: DateTime<Utc>,
    /// Expiry timestamp
    pub expiry_date: DateTime<Utc>,
}

/// Reference to an uploaded artifact held by the file service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    /// File service id
    pub file_id: String,
    /// Document category (land title, soil test, ...)
    pub category: String,
    /// Storage path reported by the file service
    pub path: String,
    /// Who uploaded it
    pub uploaded_by: UserId,
    /// When it was attached
    pub attached_at: DateTime<Utc>,
}
