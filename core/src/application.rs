//! The Application aggregate: its relational row, its document and the
//! merged view returned to callers.

use crate::capability::StaffAssignments;
use crate::ids::{ApplicationId, ProductId, UserId};
use crate::payment::PaymentRecord;
use crate::records::{
    ApprovalRecord, AttachmentRef, AuditRecord, CertificateRecord, ReviewRecord, ReviewStatus,
    WorkflowHistoryEntry,
};
use crate::workflow::{ApplicationStatus, Stage, Timeline, WorkflowSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Document collection holding application documents.
pub const APPLICATIONS_COLLECTION: &str = "applications";

/// Generate an immutable application code: `CERT-YYYYMMDD-XXXXXXXX`.
#[must_use]
pub fn generate_code(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!("CERT-{}-{suffix}", now.format("%Y%m%d"))
}

/// Authoritative columns stored in the relational `applications` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRow {
    /// Application id
    pub id: ApplicationId,
    /// Human-readable immutable code
    pub code: String,
    /// Applicant
    pub user_id: UserId,
    /// Product being certified
    pub product_id: ProductId,
    /// Workflow status
    pub status: ApplicationStatus,
    /// Coarse stage derived from status
    pub stage: Stage,
    /// Form completeness (0-100)
    pub completeness_score: u8,
    /// Number of rejected reviews
    pub rejection_count: u32,
    /// Sum of completed payment amounts
    pub total_payments: i64,
    /// Assigned staff
    pub assignments: StaffAssignments,
    /// Issued certificate number
    pub certificate_number: Option<String>,
    /// Id of the matching document
    pub document_id: String,
    /// Optimistic concurrency counter
    pub version: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Column changes applied by a conditional update.
///
/// `None` leaves a column untouched. Nullable columns take `Some(None)` to
/// clear them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPatch {
    /// New status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
    /// New stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// New completeness score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness_score: Option<u8>,
    /// New rejection count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_count: Option<u32>,
    /// New payment total
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_payments: Option<i64>,
    /// New reviewer assignment
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub reviewer_id: Option<Option<UserId>>,
    /// New auditor assignment
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub auditor_id: Option<Option<UserId>>,
    /// New approver assignment
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub approver_id: Option<Option<UserId>>,
    /// New certificate number
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub certificate_number: Option<Option<String>>,
}

/// Keeps an explicit `null` as `Some(None)`; an absent field stays `None`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl RowPatch {
    /// Patch moving the row to `status` (and its stage).
    #[must_use]
    pub fn status(status: ApplicationStatus) -> Self {
        Self {
            status: Some(status),
            stage: Some(status.stage()),
            ..Self::default()
        }
    }

    /// True if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of the columns this patch touches.
    #[must_use]
    pub fn fields(&self) -> Vec<&'static str> {
        [
            ("status", self.status.is_some()),
            ("stage", self.stage.is_some()),
            ("completenessScore", self.completeness_score.is_some()),
            ("rejectionCount", self.rejection_count.is_some()),
            ("totalPayments", self.total_payments.is_some()),
            ("reviewerId", self.reviewer_id.is_some()),
            ("auditorId", self.auditor_id.is_some()),
            ("approverId", self.approver_id.is_some()),
            ("certificateNumber", self.certificate_number.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }

    /// Patch restoring `row`'s values for every column this patch touches.
    #[must_use]
    pub fn inverse(&self, row: &ApplicationRow) -> Self {
        Self {
            status: self.status.map(|_| row.status),
            stage: self.stage.map(|_| row.stage),
            completeness_score: self.completeness_score.map(|_| row.completeness_score),
            rejection_count: self.rejection_count.map(|_| row.rejection_count),
            total_payments: self.total_payments.map(|_| row.total_payments),
            reviewer_id: self.reviewer_id.map(|_| row.assignments.reviewer_id),
            auditor_id: self.auditor_id.map(|_| row.assignments.auditor_id),
            approver_id: self.approver_id.map(|_| row.assignments.approver_id),
            certificate_number: self
                .certificate_number
                .as_ref()
                .map(|_| row.certificate_number.clone()),
        }
    }

    /// Apply the patch to an in-memory row. Does not touch `version`.
    pub fn apply_to(&self, row: &mut ApplicationRow) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(stage) = self.stage {
            row.stage = stage;
        }
        if let Some(score) = self.completeness_score {
            row.completeness_score = score;
        }
        if let Some(count) = self.rejection_count {
            row.rejection_count = count;
        }
        if let Some(total) = self.total_payments {
            row.total_payments = total;
        }
        if let Some(reviewer) = self.reviewer_id {
            row.assignments.reviewer_id = reviewer;
        }
        if let Some(auditor) = self.auditor_id {
            row.assignments.auditor_id = auditor;
        }
        if let Some(approver) = self.approver_id {
            row.assignments.approver_id = approver;
        }
        if let Some(number) = &self.certificate_number {
            row.certificate_number.clone_from(number);
        }
    }
}

/// Variable-schema part of the application, stored in the document store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDocument {
    /// Free-form form content
    #[serde(default)]
    pub form_data: Map<String, Value>,
    /// Payment records, append-only apart from status changes
    #[serde(default)]
    pub payment_history: Vec<PaymentRecord>,
    /// Review rounds
    #[serde(default)]
    pub reviews: Vec<ReviewRecord>,
    /// Audit rounds
    #[serde(default)]
    pub audits: Vec<AuditRecord>,
    /// Approval decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
    /// Append-only audit trail
    #[serde(default)]
    pub workflow_history: Vec<WorkflowHistoryEntry>,
    /// First-touch milestones
    #[serde(default)]
    pub timeline: Timeline,
    /// Issued certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRecord>,
    /// Uploaded artifact references
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

/// Merged view of an application across both stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Application id
    pub id: ApplicationId,
    /// Immutable code
    pub code: String,
    /// Applicant
    pub user_id: UserId,
    /// Product being certified
    pub product_id: ProductId,
    /// Workflow status
    pub status: ApplicationStatus,
    /// Coarse stage
    pub stage: Stage,
    /// Form completeness (0-100)
    pub completeness_score: u8,
    /// Number of rejected reviews
    pub rejection_count: u32,
    /// Sum of completed payment amounts
    pub total_payments: i64,
    /// Assigned staff
    pub assignments: StaffAssignments,
    /// Optimistic concurrency counter
    pub version: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Form content
    pub form_data: Map<String, Value>,
    /// Payment records
    pub payment_history: Vec<PaymentRecord>,
    /// Review rounds
    pub reviews: Vec<ReviewRecord>,
    /// Audit rounds
    pub audits: Vec<AuditRecord>,
    /// Approval decision
    pub approval: Option<ApprovalRecord>,
    /// Audit trail
    pub workflow_history: Vec<WorkflowHistoryEntry>,
    /// Milestones
    pub timeline: Timeline,
    /// Issued certificate
    pub certificate: Option<CertificateRecord>,
    /// Artifact references
    pub attachments: Vec<AttachmentRef>,
}

impl Application {
    /// Merge the authoritative row with its document.
    #[must_use]
    pub fn from_parts(row: ApplicationRow, document: ApplicationDocument) -> Self {
        Self {
            id: row.id,
            code: row.code,
            user_id: row.user_id,
            product_id: row.product_id,
            status: row.status,
            stage: row.stage,
            completeness_score: row.completeness_score,
            rejection_count: row.rejection_count,
            total_payments: row.total_payments,
            assignments: row.assignments,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            form_data: document.form_data,
            payment_history: document.payment_history,
            reviews: document.reviews,
            audits: document.audits,
            approval: document.approval,
            workflow_history: document.workflow_history,
            timeline: document.timeline,
            certificate: document.certificate,
            attachments: document.attachments,
        }
    }

    /// State-machine inputs.
    #[must_use]
    pub fn workflow_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            status: self.status,
            rejection_count: self.rejection_count,
            last_audit_result: self.audits.last().map(|audit| audit.result),
        }
    }

    /// Number of rejected reviews on record.
    #[must_use]
    pub fn rejected_reviews(&self) -> u32 {
        let count = self
            .reviews
            .iter()
            .filter(|review| review.status == ReviewStatus::Rejected)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ApplicationRow {
        let now = Utc::now();
        ApplicationRow {
            id: ApplicationId::new(),
            code: generate_code(now),
            user_id: UserId::new(),
            product_id: ProductId::new(),
            status: ApplicationStatus::Draft,
            stage: Stage::Application,
            completeness_score: 40,
            rejection_count: 0,
            total_payments: 0,
            assignments: StaffAssignments::default(),
            certificate_number: None,
            document_id: String::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn code_has_expected_shape() {
        let code = generate_code(Utc::now());
        let parts: Vec<_> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "CERT");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn inverse_patch_restores_row() {
        let original = row();
        let reviewer = UserId::new();
        let patch = RowPatch {
            reviewer_id: Some(Some(reviewer)),
            total_payments: Some(5_000),
            ..RowPatch::status(ApplicationStatus::Submitted)
        };
        let inverse = patch.inverse(&original);

        let mut updated = original.clone();
        patch.apply_to(&mut updated);
        assert_eq!(updated.assignments.reviewer_id, Some(reviewer));
        assert_eq!(updated.stage, Stage::Application);

        inverse.apply_to(&mut updated);
        assert_eq!(updated, original);
    }

    #[test]
    fn cleared_assignment_survives_serialization() {
        let patch = RowPatch {
            reviewer_id: Some(None),
            ..RowPatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap_or_default();
        let back: RowPatch = serde_json::from_value(json).unwrap_or_default();
        assert_eq!(back, patch);
    }

    #[test]
    fn patch_lists_touched_fields() {
        let patch = RowPatch {
            completeness_score: Some(80),
            ..RowPatch::default()
        };
        assert_eq!(patch.fields(), vec!["completenessScore"]);
        assert!(RowPatch::default().is_empty());
    }

    #[test]
    fn document_defaults_missing_sections() {
        let doc: ApplicationDocument =
            serde_json::from_value(serde_json::json!({ "formData": { "farmName": "Green" } }))
                .unwrap_or_default();
        assert_eq!(doc.form_data.get("farmName"), Some(&Value::from("Green")));
        assert!(doc.workflow_history.is_empty());
        assert_eq!(doc.timeline, Timeline::default());
    }
}
