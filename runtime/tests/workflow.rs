//! End-to-end workflow tests over the in-memory stores.
//!
//! Covers the history, rejection-count and payment invariants, the
//! completeness gate and the review-round scenarios.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use certflow_core::capability::StaffRole;
use certflow_core::collaborators::CertificateOptions;
use certflow_core::completeness::CompletenessPolicy;
use certflow_core::environment::Clock;
use certflow_core::error::{ConflictError, WorkflowError};
use certflow_core::payment::{PaymentReason, PaymentRequirement, PaymentStatus, PaymentType};
use certflow_core::records::{ApprovalDecision, AuditResult, ReviewStatus};
use certflow_core::workflow::{ApplicationStatus, Stage};
use certflow_runtime::service::{ApprovalInput, AttachmentInput, PaymentInput, PaymentOutcome};
use certflow_testing::fixtures;
use common::Harness;
use serde_json::{Map, Value, json};

fn form(fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .map(|field| ((*field).to_string(), json!("filled")))
        .collect()
}

// ============================================================================
// Creation and form editing
// ============================================================================

#[tokio::test]
async fn create_starts_a_draft_in_both_stores() {
    let h = Harness::new();
    let created = h
        .service
        .create_application(h.applicant, certflow_core::ids::ProductId::new(), fixtures::partial_form())
        .await
        .unwrap();

    assert_eq!(created.status, ApplicationStatus::Draft);
    assert!(created.code.starts_with("CERT-20250101-"));

    let row = h.relational.row(created.id).unwrap();
    assert_eq!(row.version, 1);
    assert_eq!(row.completeness_score, 40);
    assert_eq!(row.stage, Stage::Application);

    let app = h.load(created.id).await;
    assert_eq!(app.timeline.created_at, Some(h.clock.now()));
    assert!(app.workflow_history.is_empty());
}

#[tokio::test]
async fn repeated_reads_without_writes_are_identical() {
    let h = Harness::new();
    let id = h.reviewing().await;

    // First read fills the cache, second is served from it
    let first = h.service.get_application(h.applicant, id).await.unwrap();
    let second = h.service.get_application(h.applicant, id).await.unwrap();
    assert_eq!(first, second);

    // A cache outage falls back to the stores with the same result
    h.faults.set_cache_down(true);
    let third = h.service.get_application(h.applicant, id).await.unwrap();
    assert_eq!(first, third);
}

#[tokio::test]
async fn update_writes_changed_fields_and_rescores() {
    let h = Harness::new();
    let id = h.create(fixtures::partial_form()).await;

    let mut updates = fixtures::complete_form();
    updates.insert("farmName".into(), json!("Green Valley Farm"));
    let updated = h
        .service
        .update_application(h.applicant, id, updates)
        .await
        .unwrap();

    // farmName was already set to the same value
    assert!(!updated.updated_fields.contains(&"farmName".to_string()));
    assert_eq!(updated.completeness_score, 100);
    assert_eq!(h.relational.row(id).unwrap().completeness_score, 100);
    assert_eq!(h.load(id).await.form_data, fixtures::complete_form());
}

#[tokio::test]
async fn empty_update_is_rejected() {
    let h = Harness::new();
    let id = h.create(fixtures::partial_form()).await;

    let err = h
        .service
        .update_application(h.applicant, id, Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn form_is_frozen_after_submission() {
    let h = Harness::new();
    let id = h.submitted().await;

    let err = h
        .service
        .update_application(h.applicant, id, form(&["farmName"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::InvalidState { .. })
    ));
}

// ============================================================================
// Completeness gate
// ============================================================================

fn gate_policy() -> CompletenessPolicy {
    CompletenessPolicy::new([("a", 69), ("b", 1), ("c", 30)], 70)
}

#[tokio::test]
async fn submission_below_threshold_is_a_conflict() {
    let h = Harness::with_policy(gate_policy());
    let id = h.create(form(&["a"])).await;

    let err = h
        .service
        .submit_application(h.applicant, id)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WorkflowError::Conflict(ConflictError::Incomplete {
            score: 69,
            threshold: 70,
            missing: vec!["b".into(), "c".into()],
        })
    );
    assert_eq!(h.relational.row(id).unwrap().status, ApplicationStatus::Draft);
}

#[tokio::test]
async fn submission_at_threshold_waits_for_the_initial_fee() {
    let h = Harness::with_policy(gate_policy());
    let id = h.create(form(&["a", "b"])).await;

    let outcome = h.service.submit_application(h.applicant, id).await.unwrap();
    assert_eq!(outcome.status, ApplicationStatus::PaymentPendingInitial);
    assert!(!outcome.next_steps.is_empty());

    let app = h.load(id).await;
    let edges: Vec<_> = app
        .workflow_history
        .iter()
        .map(|entry| (entry.from_status, entry.to_status))
        .collect();
    assert_eq!(
        edges,
        vec![
            (ApplicationStatus::Draft, ApplicationStatus::Submitted),
            (ApplicationStatus::Submitted, ApplicationStatus::PaymentPendingInitial),
        ]
    );
    assert!(app.timeline.submitted_at.is_some());
}

// ============================================================================
// History and payments
// ============================================================================

#[tokio::test]
async fn each_transition_appends_exactly_one_history_entry() {
    let h = Harness::new();
    let id = h.submitted().await;
    let before = h.load(id).await.workflow_history;

    h.pay(id, PaymentReason::Initial).await.unwrap();
    let after = h.load(id).await.workflow_history;

    assert_eq!(after.len(), before.len() + 1);
    assert_eq!(after[..before.len()], before[..]);
}

#[tokio::test]
async fn refused_transition_leaves_history_untouched() {
    let h = Harness::new();
    let id = h.submitted().await;
    let before = h.load(id).await;

    let err = h
        .service
        .transition(h.admin, id, ApplicationStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::IllegalTransition { .. })
    ));
    assert_eq!(h.load(id).await.workflow_history, before.workflow_history);
    assert_eq!(h.relational.row(id).unwrap().version, before.version);
}

#[tokio::test]
async fn unpaid_gate_blocks_the_transition() {
    let h = Harness::new();
    let id = h.submitted().await;

    let err = h
        .service
        .transition(h.admin, id, ApplicationStatus::Reviewing, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WorkflowError::Conflict(ConflictError::PaymentRequired {
            reason: PaymentReason::Initial,
            amount: 5_000,
        })
    );
}

#[tokio::test]
async fn payment_total_tracks_completed_amounts() {
    let h = Harness::new();
    let id = h.reviewing().await;

    let app = h.load(id).await;
    assert_eq!(app.total_payments, 5_000);
    assert_eq!(
        app.total_payments,
        app.payment_history
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed)
            .map(|p| p.amount)
            .sum::<i64>()
    );
}

#[tokio::test]
async fn wrong_amount_or_reason_is_rejected() {
    let h = Harness::new();
    let id = h.submitted().await;

    let wrong_amount = h
        .service
        .record_payment(
            h.applicant,
            id,
            PaymentInput {
                reason: PaymentReason::Initial,
                amount: 4_999,
                method: None,
                gateway_reference: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(wrong_amount.kind(), "validation");

    let wrong_reason = h
        .service
        .record_payment(
            h.applicant,
            id,
            PaymentInput {
                reason: PaymentReason::AuditFail,
                amount: 25_000,
                method: None,
                gateway_reference: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(wrong_reason.kind(), "validation");
}

#[tokio::test]
async fn failed_payment_keeps_the_gate_closed() {
    let h = Harness::new();
    let id = h.submitted().await;
    let payment = h
        .service
        .record_payment(
            h.applicant,
            id,
            PaymentInput {
                reason: PaymentReason::Initial,
                amount: 5_000,
                method: None,
                gateway_reference: None,
            },
        )
        .await
        .unwrap();

    let app = h
        .service
        .confirm_payment(h.admin, id, payment.id, PaymentOutcome::Failed, None)
        .await
        .unwrap();
    assert_eq!(app.status, ApplicationStatus::PaymentPendingInitial);
    assert_eq!(app.total_payments, 0);
    assert_eq!(app.payment_history[0].status, PaymentStatus::Failed);

    // A fresh attempt is accepted after the failure
    h.pay(id, PaymentReason::Initial).await.unwrap();
    assert_eq!(h.load(id).await.status, ApplicationStatus::Reviewing);
}

#[tokio::test]
async fn refund_keeps_the_total_exact() {
    let h = Harness::new();
    let id = h.submitted().await;
    let payment_id = h.pay(id, PaymentReason::Initial).await.unwrap();

    let refund = h
        .service
        .refund_payment(h.admin, id, payment_id, Some("duplicate charge".into()))
        .await
        .unwrap();
    assert_eq!(refund.amount, -5_000);
    assert_eq!(refund.payment_type, PaymentType::Refund);
    assert_eq!(refund.refund_of, Some(payment_id));

    let app = h.load(id).await;
    assert_eq!(app.total_payments, 0);
    assert!(app
        .payment_history
        .iter()
        .all(|p| p.status == PaymentStatus::Refunded));

    let again = h
        .service
        .refund_payment(h.admin, id, payment_id, None)
        .await
        .unwrap_err();
    assert_eq!(again.kind(), "validation");
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let h = Harness::new();
    let id = h.submitted().await;
    let err = h
        .service
        .confirm_payment(
            h.admin,
            id,
            certflow_core::ids::PaymentId::new(),
            PaymentOutcome::Completed,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

// ============================================================================
// Review rounds
// ============================================================================

#[tokio::test]
async fn scenario_first_rejection_returns_to_review_without_payment() {
    let h = Harness::new();
    let id = h.reviewing().await;
    h.review(id, ReviewStatus::Rejected).await.unwrap();

    let info = h.service.get_next_stage_info(h.applicant, id).await.unwrap();
    assert_eq!(info.current, ApplicationStatus::Rejected);
    assert_eq!(info.next, Some(ApplicationStatus::Reviewing));
    assert!(!info.requires_payment);
    assert!(info.legal_targets.contains(&ApplicationStatus::Cancelled));
    assert_eq!(h.service.payment_required(h.applicant, id).await.unwrap(), None);

    assert_eq!(h.resubmit(id).await, ApplicationStatus::Reviewing);
}

#[tokio::test]
async fn scenario_second_rejection_requires_the_third_review_fee() {
    let h = Harness::new();
    let id = h.reviewing().await;
    h.review(id, ReviewStatus::Rejected).await.unwrap();
    h.resubmit(id).await;
    let app = h.review(id, ReviewStatus::Rejected).await.unwrap();
    assert_eq!(app.rejection_count, 2);

    let fee = PaymentRequirement {
        reason: PaymentReason::ThirdReview,
        amount: 5_000,
    };
    let info = h.service.get_next_stage_info(h.applicant, id).await.unwrap();
    assert_eq!(info.next, Some(ApplicationStatus::PaymentPendingReview));
    assert!(info.requires_payment);
    assert_eq!(info.payment, Some(fee));
    assert_eq!(h.service.payment_required(h.applicant, id).await.unwrap(), Some(fee));

    // Straight back to review is illegal, the pending state is allowed
    let err = h
        .service
        .transition(h.admin, id, ApplicationStatus::Reviewing, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(h.resubmit(id).await, ApplicationStatus::PaymentPendingReview);

    let err = h
        .service
        .transition(h.admin, id, ApplicationStatus::Reviewing, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WorkflowError::Conflict(ConflictError::PaymentRequired {
            reason: PaymentReason::ThirdReview,
            amount: 5_000,
        })
    );

    h.pay(id, PaymentReason::ThirdReview).await.unwrap();
    let app = h.load(id).await;
    assert_eq!(app.status, ApplicationStatus::Reviewing);
    assert_eq!(app.total_payments, 10_000);
}

#[tokio::test]
async fn scenario_initial_payment_starts_review_once() {
    let h = Harness::new();
    let id = h.submitted().await;
    h.pay(id, PaymentReason::Initial).await.unwrap();

    let app = h.load(id).await;
    let last = app.workflow_history.last().unwrap();
    assert_eq!(last.from_status, ApplicationStatus::PaymentPendingInitial);
    assert_eq!(last.to_status, ApplicationStatus::Reviewing);
    let review_started = app.timeline.review_started_at.unwrap();

    // Going round again does not move the milestone
    h.clock.advance(chrono::Duration::days(3));
    h.review(id, ReviewStatus::Rejected).await.unwrap();
    h.resubmit(id).await;
    let app = h.load(id).await;
    assert_eq!(app.status, ApplicationStatus::Reviewing);
    assert_eq!(app.timeline.review_started_at, Some(review_started));
}

#[tokio::test]
async fn rejection_count_matches_rejected_reviews() {
    let h = Harness::new();
    let id = h.reviewing().await;

    for _ in 0..2 {
        h.review(id, ReviewStatus::Rejected).await.unwrap();
        let app = h.load(id).await;
        let rejected = app
            .reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Rejected)
            .count();
        assert_eq!(app.rejection_count as usize, rejected);
        if app.rejection_count < 2 {
            h.resubmit(id).await;
        }
    }

    let rounds: Vec<u32> = h.load(id).await.reviews.iter().map(|r| r.round).collect();
    assert_eq!(rounds, vec![1, 2]);
}

// ============================================================================
// Audits, approval and certificate
// ============================================================================

#[tokio::test]
async fn failed_and_inconclusive_audits_charge_the_audit_fees() {
    for (result, reason, target) in [
        (AuditResult::Failed, PaymentReason::AuditFail, ApplicationStatus::ReAuditing),
        (AuditResult::Doubt, PaymentReason::FieldAudit, ApplicationStatus::FieldAuditing),
    ] {
        let h = Harness::new();
        let id = h.reviewing().await;
        h.review(id, ReviewStatus::Approved).await.unwrap();
        h.audit(id, result).await.unwrap();

        let required = h.service.payment_required(h.admin, id).await.unwrap().unwrap();
        assert_eq!(required.amount, 25_000);
        assert_eq!(required.reason, reason);

        h.pay(id, reason).await.unwrap();
        assert_eq!(h.load(id).await.status, target);

        let app = h.audit(id, AuditResult::Passed).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::ApprovalPending);
        assert_eq!(app.audits.len(), 2);
    }
}

#[tokio::test]
async fn approval_and_certificate_close_the_application() {
    let h = Harness::new();
    let id = h.approval_pending().await;

    h.service
        .decide_approval(
            h.approver,
            id,
            ApprovalInput {
                decision: ApprovalDecision::Approved,
                comments: Some("all good".into()),
            },
        )
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::days(10));
    let app = h
        .service
        .issue_certificate(h.approver, id, CertificateOptions::default())
        .await
        .unwrap();

    assert_eq!(app.status, ApplicationStatus::CertificateIssued);
    let certificate = app.certificate.unwrap();
    assert_eq!(certificate.certificate_number, format!("CN-{}", app.code));
    assert_eq!(app.timeline.total_processing_days, Some(10));
    assert_eq!(app.assignments.approver_id, Some(h.approver.id));
    assert_eq!(
        h.relational.row(id).unwrap().certificate_number,
        Some(certificate.certificate_number)
    );
    assert_eq!(h.issuer.issued().len(), 1);

    let err = h
        .service
        .cancel_application(h.admin, id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::TerminalState { .. })
    ));
}

#[tokio::test]
async fn issuer_failure_leaves_the_application_approved() {
    let h = Harness::new();
    let id = h.approval_pending().await;
    h.service
        .decide_approval(
            h.approver,
            id,
            ApprovalInput {
                decision: ApprovalDecision::Approved,
                comments: None,
            },
        )
        .await
        .unwrap();

    h.issuer.set_failing(true);
    let err = h
        .service
        .issue_certificate(h.approver, id, CertificateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "external");
    assert_eq!(h.load(id).await.status, ApplicationStatus::Approved);
}

#[tokio::test]
async fn failed_write_after_issue_leaves_the_application_approved() {
    let h = Harness::new();
    let id = h.approval_pending().await;
    h.service
        .decide_approval(
            h.approver,
            id,
            ApprovalInput {
                decision: ApprovalDecision::Approved,
                comments: None,
            },
        )
        .await
        .unwrap();

    h.faults.fail_step(0);
    let err = h
        .service
        .issue_certificate(h.approver, id, CertificateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "store");
    assert_eq!(h.issuer.issued().len(), 1);

    assert_eq!(h.relational.row(id).unwrap().certificate_number, None);
    let app = h.load(id).await;
    assert_eq!(app.status, ApplicationStatus::Approved);
    assert!(app.certificate.is_none());
}

#[tokio::test]
async fn certificate_requires_approval() {
    let h = Harness::new();
    let id = h.approval_pending().await;
    let err = h
        .service
        .issue_certificate(h.approver, id, CertificateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::InvalidState { .. })
    ));
    assert!(h.issuer.issued().is_empty());
}

// ============================================================================
// Other operations
// ============================================================================

#[tokio::test]
async fn advance_follows_the_happy_path() {
    let h = Harness::new();
    let id = h.reviewing().await;

    let app = h.service.advance(h.admin, id, None).await.unwrap();
    assert_eq!(app.status, ApplicationStatus::Auditing);

    let draft = h.create(fixtures::complete_form()).await;
    let err = h.service.advance(h.admin, draft, None).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn can_proceed_reports_the_blocking_reason() {
    let h = Harness::new();
    let id = h.submitted().await;

    let check = h.service.can_proceed_to_next_stage(h.applicant, id).await.unwrap();
    assert_eq!(check.next, Some(ApplicationStatus::Reviewing));
    assert!(!check.can_proceed);
    assert!(check.reason.unwrap().contains("Payment required"));

    let draft = h.create(fixtures::complete_form()).await;
    let check = h.service.can_proceed_to_next_stage(h.applicant, draft).await.unwrap();
    assert!(check.can_proceed);
}

#[tokio::test]
async fn assignment_and_attachment_are_recorded() {
    let h = Harness::new();
    let id = h.reviewing().await;

    let app = h
        .service
        .assign_staff(h.admin, id, StaffRole::Reviewer, h.reviewer)
        .await
        .unwrap();
    assert_eq!(app.assignments.reviewer_id, Some(h.reviewer.id));

    let attachment = h
        .service
        .attach_document(
            h.applicant,
            id,
            AttachmentInput {
                file_id: "file-1".into(),
                category: "land_title".into(),
                path: "uploads/file-1.pdf".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(attachment.uploaded_by, h.applicant.id);
    assert_eq!(h.load(id).await.attachments, vec![attachment]);
}

#[tokio::test]
async fn cancellation_is_terminal() {
    let h = Harness::new();
    let id = h.submitted().await;

    let app = h
        .service
        .cancel_application(h.applicant, id, Some("changed my mind".into()))
        .await
        .unwrap();
    assert_eq!(app.status, ApplicationStatus::Cancelled);
    assert_eq!(app.stage, Stage::Closed);
    assert_eq!(
        app.workflow_history.last().unwrap().comments.as_deref(),
        Some("changed my mind")
    );

    let err = h.pay(id, PaymentReason::Initial).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict(ConflictError::TerminalState { .. })
    ));
}

#[tokio::test]
async fn transitions_are_notified() {
    let h = Harness::new();
    let id = h.submitted().await;

    let sent = h.notifier.wait_for(2).await;
    let targets: Vec<_> = sent.iter().map(|n| n.target_state).collect();
    assert_eq!(targets.len(), 2);
    assert!(targets.contains(&ApplicationStatus::Submitted));
    assert!(targets.contains(&ApplicationStatus::PaymentPendingInitial));
    assert!(sent.iter().all(|n| n.application.id == id));
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_operation() {
    let h = Harness::new();
    h.notifier.set_failing(true);
    let id = h.submitted().await;
    assert_eq!(
        h.load(id).await.status,
        ApplicationStatus::PaymentPendingInitial
    );
}
