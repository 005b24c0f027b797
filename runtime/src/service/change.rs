//! Accumulates one business operation's writes into a saga plan.
//!
//! A [`Change`] starts from an authoritative read of the row and document.
//! Each transition is checked against the evolving snapshot, so a change that
//! chains several transitions (`draft -> submitted -> payment_pending_1`)
//! validates every edge, and payment gates see payments recorded earlier in
//! the same change.

use certflow_core::application::{APPLICATIONS_COLLECTION, Application, ApplicationRow, RowPatch};
use certflow_core::capability::Actor;
use certflow_core::error::{StoreError, StoreKind, WorkflowError};
use certflow_core::payment::PaymentRecord;
use certflow_core::records::{AuditResult, WorkflowHistoryEntry};
use certflow_core::saga::SagaPlan;
use certflow_core::store::{DocumentOp, RelationalOp, path};
use certflow_core::workflow::{
    ApplicationStatus, Milestone, WorkflowSnapshot, evaluate_transition, processing_days,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// `(from, to)` of a transition taken by a change.
pub(crate) type Edge = (ApplicationStatus, ApplicationStatus);

pub(crate) struct Change<'a> {
    row: &'a ApplicationRow,
    application: &'a Application,
    actor: Actor,
    now: DateTime<Utc>,
    snapshot: WorkflowSnapshot,
    payments: Vec<PaymentRecord>,
    history: Vec<WorkflowHistoryEntry>,
    patch: RowPatch,
    documents: Vec<DocumentOp>,
    milestones: Vec<Milestone>,
    edges: Vec<Edge>,
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, WorkflowError> {
    serde_json::to_value(value).map_err(|e| {
        StoreError::new(StoreKind::Document, format!("failed to encode document value: {e}")).into()
    })
}

impl<'a> Change<'a> {
    pub(crate) fn new(
        row: &'a ApplicationRow,
        application: &'a Application,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            row,
            application,
            actor,
            now,
            snapshot: application.workflow_snapshot(),
            payments: application.payment_history.clone(),
            history: application.workflow_history.clone(),
            patch: RowPatch::default(),
            documents: Vec::new(),
            milestones: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Status after the transitions taken so far.
    pub(crate) const fn status(&self) -> ApplicationStatus {
        self.snapshot.status
    }

    pub(crate) fn patch_mut(&mut self) -> &mut RowPatch {
        &mut self.patch
    }

    pub(crate) fn set(&mut self, path: Vec<String>, value: Value, previous: Option<Value>) {
        self.documents.push(DocumentOp::Set {
            collection: APPLICATIONS_COLLECTION.to_string(),
            id: self.row.document_id.clone(),
            path,
            value,
            previous,
        });
    }

    pub(crate) fn push(&mut self, path: Vec<String>, value: Value) {
        self.documents.push(DocumentOp::Push {
            collection: APPLICATIONS_COLLECTION.to_string(),
            id: self.row.document_id.clone(),
            path,
            value,
        });
    }

    fn set_if_absent(&mut self, path: Vec<String>, value: Value) {
        self.documents.push(DocumentOp::SetIfAbsent {
            collection: APPLICATIONS_COLLECTION.to_string(),
            id: self.row.document_id.clone(),
            path,
            value,
        });
    }

    pub(crate) fn push_payment(&mut self, record: PaymentRecord) -> Result<(), WorkflowError> {
        self.push(path(["paymentHistory"]), to_json(&record)?);
        self.payments.push(record);
        Ok(())
    }

    pub(crate) fn replace_payment(
        &mut self,
        index: usize,
        record: PaymentRecord,
    ) -> Result<(), WorkflowError> {
        let previous = self
            .payments
            .get(index)
            .map(to_json)
            .transpose()?;
        self.set(
            vec!["paymentHistory".to_string(), index.to_string()],
            to_json(&record)?,
            previous,
        );
        if let Some(slot) = self.payments.get_mut(index) {
            *slot = record;
        }
        Ok(())
    }

    pub(crate) fn set_rejection_count(&mut self, count: u32) {
        self.snapshot.rejection_count = count;
        self.patch.rejection_count = Some(count);
    }

    pub(crate) fn set_last_audit(&mut self, result: AuditResult) {
        self.snapshot.last_audit_result = Some(result);
    }

    /// Take the edge `status -> to`.
    ///
    /// Appends a history entry, moves status and stage, records the target's
    /// milestone the first time it is reached and, on certificate issue, the
    /// total processing time.
    pub(crate) fn transition(
        &mut self,
        to: ApplicationStatus,
        action: &str,
        comments: Option<String>,
        metadata: Option<Value>,
    ) -> Result<(), WorkflowError> {
        let from = self.snapshot.status;
        evaluate_transition(&self.snapshot, to, &self.payments, &self.history)?;

        let entry = WorkflowHistoryEntry {
            from_status: from,
            to_status: to,
            actor_id: self.actor.id,
            actor_role: self.actor.role,
            action: action.to_string(),
            timestamp: self.now,
            comments,
            metadata,
        };
        self.push(path(["workflowHistory"]), to_json(&entry)?);
        self.history.push(entry);

        let status = RowPatch::status(to);
        self.patch.status = status.status;
        self.patch.stage = status.stage;
        self.snapshot.status = to;

        if let Some(milestone) = Milestone::on_enter(to) {
            let unset = self.application.timeline.get(milestone).is_none();
            if unset && !self.milestones.contains(&milestone) {
                self.milestones.push(milestone);
                self.set_if_absent(path(["timeline", milestone.key()]), to_json(&self.now)?);
            }
        }

        if to == ApplicationStatus::CertificateIssued {
            if let Some(submitted_at) = self.application.timeline.submitted_at {
                let days = processing_days(submitted_at, self.now);
                let previous = self.application.timeline.total_processing_days.map(Value::from);
                self.set(path(["timeline", "totalProcessingDays"]), Value::from(days), previous);
            }
        }

        self.edges.push((from, to));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.patch.is_empty() && self.documents.is_empty()
    }

    /// Build the saga: the conditional row update first, then the document
    /// writes in the order they were made.
    ///
    /// The row update is emitted even with an empty patch so the version
    /// check and bump cover document-only changes.
    pub(crate) fn into_plan(self, label: &str) -> (SagaPlan, Vec<Edge>) {
        let previous = self.patch.inverse(self.row);
        let plan = SagaPlan::new(label)
            .relational(RelationalOp::UpdateApplication {
                id: self.row.id,
                expected_version: self.row.version,
                patch: self.patch,
                previous,
            })
            .documents(self.documents);
        (plan, self.edges)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use certflow_core::application::ApplicationDocument;
    use certflow_core::capability::Role;
    use certflow_core::error::ConflictError;
    use certflow_core::ids::{PaymentId, UserId};
    use certflow_core::payment::{PaymentReason, PaymentStatus, PaymentType};
    use certflow_core::store::StoreOp;
    use certflow_testing::fixtures;

    fn fixture(status: ApplicationStatus) -> (ApplicationRow, Application) {
        let now = Utc::now();
        let mut row = fixtures::draft_row(UserId::new(), now);
        row.status = status;
        row.stage = status.stage();
        let app = Application::from_parts(row.clone(), ApplicationDocument::default());
        (row, app)
    }

    fn admin() -> Actor {
        Actor::new(UserId::new(), Role::Admin)
    }

    #[test]
    fn chained_transitions_record_history_and_milestones() {
        let (row, app) = fixture(ApplicationStatus::Draft);
        let mut change = Change::new(&row, &app, admin(), Utc::now());
        change
            .transition(ApplicationStatus::Submitted, "submit", None, None)
            .unwrap();
        change
            .transition(ApplicationStatus::PaymentPendingInitial, "submit", None, None)
            .unwrap();
        assert_eq!(change.status(), ApplicationStatus::PaymentPendingInitial);

        let (plan, edges) = change.into_plan("submit");
        assert_eq!(edges.len(), 2);
        // row update, two history pushes, submittedAt
        assert_eq!(plan.operations.len(), 4);
        let StoreOp::Relational(RelationalOp::UpdateApplication {
            expected_version,
            patch,
            previous,
            ..
        }) = &plan.operations[0]
        else {
            unreachable!("row update comes first");
        };
        assert_eq!(*expected_version, 1);
        assert_eq!(patch.status, Some(ApplicationStatus::PaymentPendingInitial));
        assert_eq!(previous.status, Some(ApplicationStatus::Draft));
    }

    #[test]
    fn unpaid_gate_is_refused() {
        let (row, app) = fixture(ApplicationStatus::PaymentPendingInitial);
        let mut change = Change::new(&row, &app, admin(), Utc::now());
        let err = change
            .transition(ApplicationStatus::Reviewing, "transition", None, None)
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::Conflict(ConflictError::PaymentRequired {
                reason: PaymentReason::Initial,
                amount: 5_000
            })
        );
    }

    #[test]
    fn payment_recorded_in_the_same_change_opens_the_gate() {
        let (row, app) = fixture(ApplicationStatus::PaymentPendingInitial);
        let now = Utc::now();
        let mut change = Change::new(&row, &app, admin(), now);
        change
            .push_payment(PaymentRecord {
                id: PaymentId::new(),
                amount: 5_000,
                payment_type: PaymentType::Charge,
                reason: PaymentReason::Initial,
                status: PaymentStatus::Completed,
                gateway_reference: None,
                method: None,
                refund_of: None,
                created_at: now,
                completed_at: Some(now),
            })
            .unwrap();
        change
            .transition(ApplicationStatus::Reviewing, "confirm_payment", None, None)
            .unwrap();
    }

    #[test]
    fn reached_milestone_is_not_rewritten() {
        let (row, mut app) = fixture(ApplicationStatus::Rejected);
        app.timeline.review_started_at = Some(Utc::now());
        app.rejection_count = 1;
        let mut change = Change::new(&row, &app, admin(), Utc::now());
        change
            .transition(ApplicationStatus::Reviewing, "resubmit", None, None)
            .unwrap();

        let (plan, _) = change.into_plan("resubmit");
        assert!(!plan.operations.iter().any(|op| matches!(
            op,
            StoreOp::Document(DocumentOp::SetIfAbsent { .. })
        )));
    }
}
