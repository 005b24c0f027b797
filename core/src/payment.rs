//! Payment records, the fee schedule and payment-gate accounting.
//!
//! All amounts are signed minor currency units. Refunds are stored as records
//! with a negative amount; both the refunded charge and its refund record move
//! to [`PaymentStatus::Refunded`], so `total_payments` always equals the sum of
//! `completed` amounts.

use crate::ids::PaymentId;
use crate::workflow::ApplicationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a payment is collected. Each reason has a fixed fee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PaymentReason {
    /// Initial application fee, collected after submission
    #[serde(rename = "initial")]
    Initial,
    /// Fee for the third and later review rounds
    #[serde(rename = "3rd_review")]
    ThirdReview,
    /// Re-audit fee after a failed audit
    #[serde(rename = "audit_fail")]
    AuditFail,
    /// Field audit fee after an inconclusive audit
    #[serde(rename = "field_audit")]
    FieldAudit,
}

impl PaymentReason {
    /// Every payment reason.
    pub const ALL: [Self; 4] = [
        Self::Initial,
        Self::ThirdReview,
        Self::AuditFail,
        Self::FieldAudit,
    ];

    /// Fixed fee for this reason.
    #[must_use]
    pub const fn fee(self) -> i64 {
        match self {
            Self::Initial | Self::ThirdReview => 5_000,
            Self::AuditFail | Self::FieldAudit => 25_000,
        }
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ThirdReview => "3rd_review",
            Self::AuditFail => "audit_fail",
            Self::FieldAudit => "field_audit",
        }
    }

    /// The state in which the application waits for this payment.
    #[must_use]
    pub const fn pending_state(self) -> ApplicationStatus {
        match self {
            Self::Initial => ApplicationStatus::PaymentPendingInitial,
            Self::ThirdReview => ApplicationStatus::PaymentPendingReview,
            Self::AuditFail | Self::FieldAudit => ApplicationStatus::PaymentPendingAudit,
        }
    }

    /// The transition this payment unlocks.
    #[must_use]
    pub const fn gate_edge(self) -> (ApplicationStatus, ApplicationStatus) {
        match self {
            Self::Initial => (
                ApplicationStatus::PaymentPendingInitial,
                ApplicationStatus::Reviewing,
            ),
            Self::ThirdReview => (
                ApplicationStatus::PaymentPendingReview,
                ApplicationStatus::Reviewing,
            ),
            Self::AuditFail => (
                ApplicationStatus::PaymentPendingAudit,
                ApplicationStatus::ReAuditing,
            ),
            Self::FieldAudit => (
                ApplicationStatus::PaymentPendingAudit,
                ApplicationStatus::FieldAuditing,
            ),
        }
    }
}

impl fmt::Display for PaymentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown payment reason: {s}"))
    }
}

/// A payment the application must have completed before it may proceed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequirement {
    /// Why the payment is due
    pub reason: PaymentReason,
    /// Amount due, per the fee schedule
    pub amount: i64,
}

impl PaymentRequirement {
    /// Requirement for the given reason at the scheduled fee.
    #[must_use]
    pub const fn for_reason(reason: PaymentReason) -> Self {
        Self {
            reason,
            amount: reason.fee(),
        }
    }
}

/// Direction of money movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Money collected from the applicant
    Charge,
    /// Money returned to the applicant (negative amount)
    Refund,
}

/// Settlement status of a payment record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Awaiting gateway confirmation
    Pending,
    /// Settled; counts toward `total_payments`
    Completed,
    /// Rejected by the gateway
    Failed,
    /// Reversed by a refund
    Refunded,
}

impl PaymentStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// One entry of an application's payment history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Record id
    pub id: PaymentId,
    /// Signed amount (negative for refunds)
    pub amount: i64,
    /// Charge or refund
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    /// Why the payment was collected
    pub reason: PaymentReason,
    /// Settlement status
    pub status: PaymentStatus,
    /// Reference assigned by the payment gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_reference: Option<String>,
    /// Payment method label (card, bank transfer, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// For refunds: the charge being reversed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_of: Option<PaymentId>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record reached a final status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Sum of all completed amounts.
#[must_use]
pub fn total_completed(records: &[PaymentRecord]) -> i64 {
    records
        .iter()
        .filter(|record| record.status == PaymentStatus::Completed)
        .map(|record| record.amount)
        .sum()
}

/// Number of completed charges collected for `reason`.
#[must_use]
pub fn completed_charges(records: &[PaymentRecord], reason: PaymentReason) -> usize {
    records
        .iter()
        .filter(|record| {
            record.reason == reason
                && record.payment_type == PaymentType::Charge
                && record.status == PaymentStatus::Completed
        })
        .count()
}
