//! Certification workflow state machine.
//!
//! Pure functions over a [`WorkflowSnapshot`]: which edges are legal, which
//! payment a state requires, and whether a gated edge has been paid for. The
//! service re-reads the authoritative store before calling any of these.
//!
//! Gate accounting is per round: an edge gated by a [`PaymentReason`] opens
//! only while the number of completed charges for that reason exceeds the
//! number of times the edge has already been taken.

use crate::error::ConflictError;
use crate::payment::{PaymentReason, PaymentRecord, PaymentRequirement, completed_charges};
use crate::records::{AuditResult, WorkflowHistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workflow state of an application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    /// Being filled in by the applicant
    Draft,
    /// Submitted, awaiting the initial fee
    Submitted,
    /// Initial fee outstanding
    #[serde(rename = "payment_pending_1")]
    PaymentPendingInitial,
    /// Documents under review
    Reviewing,
    /// Review rejected; applicant may resubmit
    Rejected,
    /// Third-review fee outstanding
    #[serde(rename = "payment_pending_2")]
    PaymentPendingReview,
    /// First audit in progress
    Auditing,
    /// Audit failed
    AuditFailed,
    /// Audit inconclusive
    AuditDoubt,
    /// Re-audit or field audit fee outstanding
    #[serde(rename = "payment_pending_3")]
    PaymentPendingAudit,
    /// Paid re-audit in progress
    ReAuditing,
    /// Paid field audit in progress
    FieldAuditing,
    /// Awaiting the approver
    ApprovalPending,
    /// Approved, certificate not yet issued
    Approved,
    /// Certificate issued (terminal)
    CertificateIssued,
    /// Closed as rejected (terminal)
    RejectedFinal,
    /// Cancelled (terminal)
    Cancelled,
}

impl ApplicationStatus {
    /// Every status, in workflow order.
    pub const ALL: [Self; 17] = [
        Self::Draft,
        Self::Submitted,
        Self::PaymentPendingInitial,
        Self::Reviewing,
        Self::Rejected,
        Self::PaymentPendingReview,
        Self::Auditing,
        Self::AuditFailed,
        Self::AuditDoubt,
        Self::PaymentPendingAudit,
        Self::ReAuditing,
        Self::FieldAuditing,
        Self::ApprovalPending,
        Self::Approved,
        Self::CertificateIssued,
        Self::RejectedFinal,
        Self::Cancelled,
    ];

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::PaymentPendingInitial => "payment_pending_1",
            Self::Reviewing => "reviewing",
            Self::Rejected => "rejected",
            Self::PaymentPendingReview => "payment_pending_2",
            Self::Auditing => "auditing",
            Self::AuditFailed => "audit_failed",
            Self::AuditDoubt => "audit_doubt",
            Self::PaymentPendingAudit => "payment_pending_3",
            Self::ReAuditing => "re_auditing",
            Self::FieldAuditing => "field_auditing",
            Self::ApprovalPending => "approval_pending",
            Self::Approved => "approved",
            Self::CertificateIssued => "certificate_issued",
            Self::RejectedFinal => "rejected_final",
            Self::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CertificateIssued | Self::RejectedFinal | Self::Cancelled
        )
    }

    /// Coarse stage used for reporting.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::Draft | Self::Submitted => Stage::Application,
            Self::PaymentPendingInitial | Self::PaymentPendingReview | Self::PaymentPendingAudit => {
                Stage::Payment
            }
            Self::Reviewing | Self::Rejected => Stage::Review,
            Self::Auditing
            | Self::AuditFailed
            | Self::AuditDoubt
            | Self::ReAuditing
            | Self::FieldAuditing => Stage::Audit,
            Self::ApprovalPending | Self::Approved => Stage::Approval,
            Self::CertificateIssued => Stage::Certification,
            Self::RejectedFinal | Self::Cancelled => Stage::Closed,
        }
    }

    /// Statically legal targets, before data-dependent rules. `cancelled` is
    /// not listed; every non-terminal state may cancel.
    #[must_use]
    pub const fn structural_targets(self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Submitted],
            Self::Submitted => &[Self::PaymentPendingInitial],
            Self::PaymentPendingInitial | Self::PaymentPendingReview => &[Self::Reviewing],
            Self::Reviewing => &[Self::Rejected, Self::Auditing, Self::RejectedFinal],
            Self::Rejected => &[
                Self::Reviewing,
                Self::PaymentPendingReview,
                Self::RejectedFinal,
            ],
            Self::Auditing => &[Self::ApprovalPending, Self::AuditFailed, Self::AuditDoubt],
            Self::AuditFailed | Self::AuditDoubt => &[Self::PaymentPendingAudit, Self::RejectedFinal],
            Self::PaymentPendingAudit => &[Self::ReAuditing, Self::FieldAuditing],
            Self::ReAuditing => &[
                Self::ApprovalPending,
                Self::AuditFailed,
                Self::AuditDoubt,
                Self::RejectedFinal,
            ],
            Self::FieldAuditing => &[
                Self::ApprovalPending,
                Self::AuditFailed,
                Self::RejectedFinal,
            ],
            Self::ApprovalPending => &[Self::Approved, Self::RejectedFinal],
            Self::Approved => &[Self::CertificateIssued],
            Self::CertificateIssued | Self::RejectedFinal | Self::Cancelled => &[],
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown application status: {s}"))
    }
}

/// Coarse workflow stage, stored alongside the status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Draft and submission
    Application,
    /// Waiting for a fee
    Payment,
    /// Document review
    Review,
    /// Audits
    Audit,
    /// Final approval
    Approval,
    /// Certificate issued
    Certification,
    /// Rejected or cancelled
    Closed,
}

impl Stage {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Payment => "payment",
            Self::Review => "review",
            Self::Audit => "audit",
            Self::Approval => "approval",
            Self::Certification => "certification",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Application,
            Self::Payment,
            Self::Review,
            Self::Audit,
            Self::Approval,
            Self::Certification,
            Self::Closed,
        ]
        .into_iter()
        .find(|stage| stage.as_str() == s)
        .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// The subset of an application the state machine decides on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkflowSnapshot {
    /// Current status
    pub status: ApplicationStatus,
    /// Number of rejected reviews
    pub rejection_count: u32,
    /// Result of the most recent audit, if any
    pub last_audit_result: Option<AuditResult>,
}

impl WorkflowSnapshot {
    /// Snapshot of a fresh draft.
    #[must_use]
    pub const fn draft() -> Self {
        Self {
            status: ApplicationStatus::Draft,
            rejection_count: 0,
            last_audit_result: None,
        }
    }
}

/// Whether `from -> to` is a legal edge for this snapshot, ignoring payments.
#[must_use]
pub fn is_legal(snapshot: &WorkflowSnapshot, to: ApplicationStatus) -> bool {
    let from = snapshot.status;
    if from.is_terminal() {
        return false;
    }
    if to == ApplicationStatus::Cancelled {
        return true;
    }
    if !from.structural_targets().contains(&to) {
        return false;
    }
    match (from, to) {
        (ApplicationStatus::Rejected, ApplicationStatus::Reviewing) => {
            snapshot.rejection_count < 2
        }
        (ApplicationStatus::Rejected, ApplicationStatus::PaymentPendingReview) => {
            snapshot.rejection_count >= 2
        }
        _ => true,
    }
}

/// Every legal target for this snapshot, `cancelled` included.
#[must_use]
pub fn legal_targets(snapshot: &WorkflowSnapshot) -> Vec<ApplicationStatus> {
    let mut targets: Vec<_> = snapshot
        .status
        .structural_targets()
        .iter()
        .copied()
        .filter(|to| is_legal(snapshot, *to))
        .collect();
    if !snapshot.status.is_terminal() {
        targets.push(ApplicationStatus::Cancelled);
    }
    targets
}

/// The payment the current state is waiting on, if any.
#[must_use]
pub fn payment_required(snapshot: &WorkflowSnapshot) -> Option<PaymentRequirement> {
    let reason = match snapshot.status {
        ApplicationStatus::PaymentPendingInitial => PaymentReason::Initial,
        ApplicationStatus::Rejected if snapshot.rejection_count >= 2 => PaymentReason::ThirdReview,
        ApplicationStatus::PaymentPendingReview => PaymentReason::ThirdReview,
        ApplicationStatus::AuditFailed => PaymentReason::AuditFail,
        ApplicationStatus::AuditDoubt => PaymentReason::FieldAudit,
        ApplicationStatus::PaymentPendingAudit => match snapshot.last_audit_result {
            Some(AuditResult::Doubt) => PaymentReason::FieldAudit,
            _ => PaymentReason::AuditFail,
        },
        _ => return None,
    };
    Some(PaymentRequirement::for_reason(reason))
}

/// The payment reason gating the edge `from -> to`, if the edge is gated.
#[must_use]
pub fn gate_for(from: ApplicationStatus, to: ApplicationStatus) -> Option<PaymentReason> {
    PaymentReason::ALL
        .into_iter()
        .find(|reason| reason.gate_edge() == (from, to))
}

/// Number of times the edge gated by `reason` has been taken.
#[must_use]
pub fn gate_passes(history: &[WorkflowHistoryEntry], reason: PaymentReason) -> usize {
    let (from, to) = reason.gate_edge();
    history
        .iter()
        .filter(|entry| entry.from_status == from && entry.to_status == to)
        .count()
}

/// Whether a fresh completed charge for `reason` is available.
#[must_use]
pub fn gate_satisfied(
    payments: &[PaymentRecord],
    history: &[WorkflowHistoryEntry],
    reason: PaymentReason,
) -> bool {
    completed_charges(payments, reason) > gate_passes(history, reason)
}

/// Decide whether `snapshot.status -> to` may happen now.
///
/// # Errors
///
/// - [`ConflictError::TerminalState`] when the application is closed
/// - [`ConflictError::IllegalTransition`] for an edge not in the table
/// - [`ConflictError::PaymentRequired`] when a gated edge is unpaid
pub fn evaluate_transition(
    snapshot: &WorkflowSnapshot,
    to: ApplicationStatus,
    payments: &[PaymentRecord],
    history: &[WorkflowHistoryEntry],
) -> Result<(), ConflictError> {
    let from = snapshot.status;
    if from.is_terminal() {
        return Err(ConflictError::TerminalState { status: from });
    }
    if !is_legal(snapshot, to) {
        return Err(ConflictError::IllegalTransition { from, to });
    }
    match gate_for(from, to) {
        Some(reason) if !gate_satisfied(payments, history, reason) => {
            Err(ConflictError::PaymentRequired {
                reason,
                amount: reason.fee(),
            })
        }
        _ => Ok(()),
    }
}

/// The happy-path next status from the current one.
///
/// Outcome-driven states (`reviewing`, `auditing`, ...) report their success
/// target; the actual target is chosen by the review, audit or approval.
#[must_use]
pub fn next_status(snapshot: &WorkflowSnapshot) -> Option<ApplicationStatus> {
    use ApplicationStatus as S;

    match snapshot.status {
        S::Draft => Some(S::Submitted),
        S::Submitted => Some(S::PaymentPendingInitial),
        S::PaymentPendingInitial | S::PaymentPendingReview => Some(S::Reviewing),
        S::Reviewing => Some(S::Auditing),
        S::Rejected if snapshot.rejection_count < 2 => Some(S::Reviewing),
        S::Rejected => Some(S::PaymentPendingReview),
        S::Auditing | S::ReAuditing | S::FieldAuditing => Some(S::ApprovalPending),
        S::AuditFailed | S::AuditDoubt => Some(S::PaymentPendingAudit),
        S::PaymentPendingAudit => match snapshot.last_audit_result {
            Some(AuditResult::Doubt) => Some(S::FieldAuditing),
            _ => Some(S::ReAuditing),
        },
        S::ApprovalPending => Some(S::Approved),
        S::Approved => Some(S::CertificateIssued),
        S::CertificateIssued | S::RejectedFinal | S::Cancelled => None,
    }
}

/// What happens next for an application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStageInfo {
    /// Current status
    pub current: ApplicationStatus,
    /// Happy-path next status
    pub next: Option<ApplicationStatus>,
    /// Whether a payment is due before progressing
    pub requires_payment: bool,
    /// The payment that is due
    pub payment: Option<PaymentRequirement>,
    /// Every status reachable from here, gates aside
    pub legal_targets: Vec<ApplicationStatus>,
}

/// Next-stage summary for a snapshot.
#[must_use]
pub fn next_stage_info(snapshot: &WorkflowSnapshot) -> NextStageInfo {
    let payment = payment_required(snapshot);
    NextStageInfo {
        current: snapshot.status,
        next: next_status(snapshot),
        requires_payment: payment.is_some(),
        payment,
        legal_targets: legal_targets(snapshot),
    }
}

/// Human-readable next steps after reaching `status`.
#[must_use]
pub fn next_steps(status: ApplicationStatus) -> Vec<String> {
    let steps: &[&str] = match status {
        ApplicationStatus::PaymentPendingInitial => &[
            "Pay the initial application fee",
            "Review starts once the payment is confirmed",
        ],
        ApplicationStatus::PaymentPendingReview => &[
            "Pay the third review fee",
            "Review resumes once the payment is confirmed",
        ],
        ApplicationStatus::Reviewing => &["Wait for the document review"],
        _ => &[],
    };
    steps.iter().map(ToString::to_string).collect()
}

// ═══════════════════════════════════════════════════════════
// Timeline
// ═══════════════════════════════════════════════════════════

/// First-touch timestamps recorded as the application progresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Milestone {
    /// Draft created
    #[serde(rename = "createdAt")]
    Created,
    /// First submission
    #[serde(rename = "submittedAt")]
    Submitted,
    /// Review started
    #[serde(rename = "reviewStartedAt")]
    ReviewStarted,
    /// First rejection
    #[serde(rename = "firstRejectedAt")]
    FirstRejected,
    /// First audit started
    #[serde(rename = "auditStartedAt")]
    AuditStarted,
    /// Re-audit started
    #[serde(rename = "reAuditStartedAt")]
    ReAuditStarted,
    /// Field audit started
    #[serde(rename = "fieldAuditStartedAt")]
    FieldAuditStarted,
    /// Approval requested
    #[serde(rename = "approvalRequestedAt")]
    ApprovalRequested,
    /// Approved
    #[serde(rename = "approvedAt")]
    Approved,
    /// Certificate issued
    #[serde(rename = "certificateIssuedAt")]
    CertificateIssued,
    /// Rejected for good or cancelled
    #[serde(rename = "closedAt")]
    Closed,
}

impl Milestone {
    /// Key inside the `timeline` object.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Created => "createdAt",
            Self::Submitted => "submittedAt",
            Self::ReviewStarted => "reviewStartedAt",
            Self::FirstRejected => "firstRejectedAt",
            Self::AuditStarted => "auditStartedAt",
            Self::ReAuditStarted => "reAuditStartedAt",
            Self::FieldAuditStarted => "fieldAuditStartedAt",
            Self::ApprovalRequested => "approvalRequestedAt",
            Self::Approved => "approvedAt",
            Self::CertificateIssued => "certificateIssuedAt",
            Self::Closed => "closedAt",
        }
    }

    /// Milestone recorded when entering `status`.
    #[must_use]
    pub const fn on_enter(status: ApplicationStatus) -> Option<Self> {
        use ApplicationStatus as S;

        match status {
            S::Submitted => Some(Self::Submitted),
            S::Reviewing => Some(Self::ReviewStarted),
            S::Rejected => Some(Self::FirstRejected),
            S::Auditing => Some(Self::AuditStarted),
            S::ReAuditing => Some(Self::ReAuditStarted),
            S::FieldAuditing => Some(Self::FieldAuditStarted),
            S::ApprovalPending => Some(Self::ApprovalRequested),
            S::Approved => Some(Self::Approved),
            S::CertificateIssued => Some(Self::CertificateIssued),
            S::RejectedFinal | S::Cancelled => Some(Self::Closed),
            S::Draft
            | S::PaymentPendingInitial
            | S::PaymentPendingReview
            | S::AuditFailed
            | S::AuditDoubt
            | S::PaymentPendingAudit => None,
        }
    }
}

/// Milestone timestamps. Each is written at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    /// Draft created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// First submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// Review started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_started_at: Option<DateTime<Utc>>,
    /// First rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_rejected_at: Option<DateTime<Utc>>,
    /// First audit started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_started_at: Option<DateTime<Utc>>,
    /// Re-audit started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_audit_started_at: Option<DateTime<Utc>>,
    /// Field audit started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_audit_started_at: Option<DateTime<Utc>>,
    /// Approval requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_requested_at: Option<DateTime<Utc>>,
    /// Approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Certificate issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_issued_at: Option<DateTime<Utc>>,
    /// Closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Whole days from submission to certificate issue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_processing_days: Option<i64>,
}

impl Timeline {
    /// Timestamp of a milestone.
    #[must_use]
    pub const fn get(&self, milestone: Milestone) -> Option<DateTime<Utc>> {
        match milestone {
            Milestone::Created => self.created_at,
            Milestone::Submitted => self.submitted_at,
            Milestone::ReviewStarted => self.review_started_at,
            Milestone::FirstRejected => self.first_rejected_at,
            Milestone::AuditStarted => self.audit_started_at,
            Milestone::ReAuditStarted => self.re_audit_started_at,
            Milestone::FieldAuditStarted => self.field_audit_started_at,
            Milestone::ApprovalRequested => self.approval_requested_at,
            Milestone::Approved => self.approved_at,
            Milestone::CertificateIssued => self.certificate_issued_at,
            Milestone::Closed => self.closed_at,
        }
    }
}

/// Whole days between submission and certificate issue.
#[must_use]
pub fn processing_days(submitted_at: DateTime<Utc>, issued_at: DateTime<Utc>) -> i64 {
    (issued_at - submitted_at).num_days()
}
