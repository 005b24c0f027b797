//! Authorization, search, caching and concurrent writers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use certflow_core::application::RowPatch;
use certflow_core::capability::{Actor, Role, StaffRole};
use certflow_core::error::{ConflictError, WorkflowError};
use certflow_core::ids::UserId;
use certflow_core::payment::PaymentReason;
use certflow_core::records::ReviewStatus;
use certflow_core::saga::SagaPlan;
use certflow_core::store::{Pagination, RelationalOp, SearchFilter, StatsFilter};
use certflow_core::workflow::ApplicationStatus;
use certflow_runtime::cache::{STATS_PREFIX, application_key};
use certflow_runtime::service::{PaymentInput, ReviewInput};
use certflow_testing::fixtures;
use common::Harness;
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn applicants_only_see_their_own_applications() {
    let h = Harness::new();
    let id = h.create(fixtures::partial_form()).await;
    let stranger = Actor::new(UserId::new(), Role::Applicant);

    let err = h.service.get_application(stranger, id).await.unwrap_err();
    assert_eq!(err.kind(), "authorization");

    // Also when the application is already cached
    h.load(id).await;
    assert!(h.cache.contains_key(&application_key(id)));
    let err = h.service.get_application(stranger, id).await.unwrap_err();
    assert_eq!(err.kind(), "authorization");

    let err = h
        .service
        .update_application(stranger, id, fixtures::complete_form())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization");
}

#[tokio::test]
async fn applicants_cannot_act_as_staff() {
    let h = Harness::new();
    let id = h.reviewing().await;

    let err = h
        .service
        .submit_review(
            h.applicant,
            id,
            ReviewInput {
                status: ReviewStatus::Approved,
                score: None,
                comments: None,
                findings: Vec::new(),
                final_rejection: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization");

    let err = h
        .service
        .transition(h.applicant, id, ApplicationStatus::Auditing, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization");
}

#[tokio::test]
async fn assigned_slot_excludes_other_staff() {
    let h = Harness::new();
    let id = h.reviewing().await;
    h.service
        .assign_staff(h.admin, id, StaffRole::Reviewer, h.reviewer)
        .await
        .unwrap();

    let other = Actor::new(UserId::new(), Role::Reviewer);
    let err = h
        .service
        .submit_review(
            other,
            id,
            ReviewInput {
                status: ReviewStatus::Approved,
                score: Some(90),
                comments: None,
                findings: Vec::new(),
                final_rejection: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization { .. }));

    let app = h.review(id, ReviewStatus::Approved).await.unwrap();
    assert_eq!(app.status, ApplicationStatus::Auditing);
}

#[tokio::test]
async fn staff_slot_requires_the_matching_role() {
    let h = Harness::new();
    let id = h.reviewing().await;
    let before = h.load(id).await;

    let err = h
        .service
        .assign_staff(h.admin, id, StaffRole::Reviewer, h.auditor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let after = h.load(id).await;
    assert_eq!(after.assignments.reviewer_id, None);
    assert_eq!(after.version, before.version);

    let app = h
        .service
        .assign_staff(h.admin, id, StaffRole::Auditor, h.auditor)
        .await
        .unwrap();
    assert_eq!(app.assignments.auditor_id, Some(h.auditor.id));
}

#[tokio::test]
async fn review_score_above_hundred_is_invalid() {
    let h = Harness::new();
    let id = h.reviewing().await;
    let err = h
        .service
        .submit_review(
            h.reviewer,
            id,
            ReviewInput {
                status: ReviewStatus::Approved,
                score: Some(101),
                comments: None,
                findings: Vec::new(),
                final_rejection: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(h.load(id).await.reviews.is_empty());
}

// ============================================================================
// Search and statistics
// ============================================================================

#[tokio::test]
async fn applicant_search_is_scoped_to_the_caller() {
    let h = Harness::new();
    h.create(fixtures::partial_form()).await;
    let stranger = Actor::new(UserId::new(), Role::Applicant);
    h.service
        .create_application(stranger, certflow_core::ids::ProductId::new(), fixtures::partial_form())
        .await
        .unwrap();

    let mine = h
        .service
        .search_applications(h.applicant, SearchFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(mine.pagination.total, 1);
    assert!(mine.rows.iter().all(|row| row.user_id == h.applicant.id));

    let all = h
        .service
        .search_applications(h.admin, SearchFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(all.pagination.total, 2);
}

#[tokio::test]
async fn free_text_search_narrows_to_matching_documents() {
    let h = Harness::new();
    h.create(fixtures::partial_form()).await;
    let mut form = fixtures::partial_form();
    form.insert("farmName".into(), json!("Sunrise Orchard"));
    let orchard = h.create(form).await;

    let results = h
        .service
        .search_applications(
            h.admin,
            SearchFilter {
                text: Some("sunrise".into()),
                ..SearchFilter::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.free_text_match_count, Some(1));
    assert_eq!(results.rows.len(), 1);
    assert_eq!(results.rows[0].id, orchard);
}

#[tokio::test]
async fn bad_page_request_is_rejected() {
    let h = Harness::new();
    let err = h
        .service
        .search_applications(
            h.admin,
            SearchFilter::default(),
            Pagination {
                page: 1,
                per_page: 500,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn stats_are_cached_until_an_application_is_created() {
    let h = Harness::new();
    h.create(fixtures::partial_form()).await;

    let stats = h
        .service
        .get_application_stats(h.admin, StatsFilter::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 1);
    assert!(h.cache.keys().iter().any(|key| key.starts_with(STATS_PREFIX)));

    h.create(fixtures::partial_form()).await;
    assert!(!h.cache.keys().iter().any(|key| key.starts_with(STATS_PREFIX)));
    let stats = h
        .service
        .get_application_stats(h.admin, StatsFilter::default())
        .await
        .unwrap();
    assert_eq!(stats.total, 2);

    let err = h
        .service
        .get_application_stats(h.applicant, StatsFilter::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "authorization");
}

// ============================================================================
// Cache behavior
// ============================================================================

#[tokio::test]
async fn writes_invalidate_the_cached_application() {
    let h = Harness::new();
    let id = h.submitted().await;

    h.load(id).await;
    assert!(h.cache.contains_key(&application_key(id)));

    h.pay(id, PaymentReason::Initial).await.unwrap();
    assert!(!h.cache.contains_key(&application_key(id)));
    assert_eq!(h.load(id).await.status, ApplicationStatus::Reviewing);
}

#[tokio::test]
async fn cache_outage_does_not_fail_the_workflow() {
    let h = Harness::new();
    h.faults.set_cache_down(true);

    let id = h.reviewing().await;
    let app = h.load(id).await;
    assert_eq!(app.status, ApplicationStatus::Reviewing);
    assert_eq!(h.cache.set_count(), 0);

    h.faults.set_cache_down(false);
    h.load(id).await;
    assert!(h.cache.contains_key(&application_key(id)));
}

#[tokio::test]
async fn read_overlapping_a_write_never_caches_the_older_version() {
    let h = Harness::new();
    let id = h.submitted().await;
    let input = PaymentInput {
        reason: PaymentReason::Initial,
        amount: PaymentReason::Initial.fee(),
        method: None,
        gateway_reference: None,
    };

    // The reader loads the row, then the write commits before it caches
    h.faults.hold_reads(2);
    let (read, recorded) = tokio::join!(
        h.service.get_application(h.admin, id),
        h.service.record_payment(h.applicant, id, input),
    );
    read.unwrap();
    recorded.unwrap();

    let latest = h.relational.row(id).unwrap();
    let served = h.load(id).await;
    assert_eq!(served.version, latest.version);
    assert_eq!(served.payment_history.len(), 1);
}

#[tokio::test]
async fn slow_cache_is_bypassed() {
    let h = Harness::new();
    let id = h.submitted().await;
    h.cache.set_latency(Some(Duration::from_millis(500)));

    let app = h.load(id).await;
    assert_eq!(app.status, ApplicationStatus::PaymentPendingInitial);

    h.pay(id, PaymentReason::Initial).await.unwrap();
    h.cache.set_latency(None);
    assert_eq!(h.load(id).await.status, ApplicationStatus::Reviewing);
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[tokio::test]
async fn stale_version_is_a_concurrent_modification() {
    let h = Harness::new();
    let id = h.create(fixtures::complete_form()).await;
    let stale = h.relational.row(id).unwrap().version;

    h.service.submit_application(h.applicant, id).await.unwrap();
    let current = h.relational.row(id).unwrap();

    let plan = SagaPlan::new("stale_write").relational(RelationalOp::UpdateApplication {
        id,
        expected_version: stale,
        patch: RowPatch::status(ApplicationStatus::Cancelled),
        previous: RowPatch::status(ApplicationStatus::Draft),
    });
    let err = h.service.coordinator().execute(plan).await.unwrap_err();
    assert_eq!(
        err,
        WorkflowError::Conflict(ConflictError::ConcurrentModification {
            id,
            expected: stale,
            actual: Some(current.version),
        })
    );
    assert_eq!(h.relational.row(id).unwrap(), current);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_one_of_two_payments_for_the_same_fee_is_accepted() {
    let h = Harness::new();
    let id = h.submitted().await;
    let input = PaymentInput {
        reason: PaymentReason::Initial,
        amount: PaymentReason::Initial.fee(),
        method: None,
        gateway_reference: None,
    };

    // Both writers see no pending payment and the same row version
    h.faults.hold_reads(2);
    let (first, second) = tokio::join!(
        h.service.record_payment(h.applicant, id, input.clone()),
        h.service.record_payment(h.applicant, id, input),
    );

    let loser = match (first, second) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => e,
        (first, second) => panic!("expected one winner, got {first:?} and {second:?}"),
    };
    assert_eq!(loser.kind(), "conflict");
    assert!(matches!(
        loser,
        WorkflowError::Conflict(ConflictError::ConcurrentModification { id: lost, .. }) if lost == id
    ));

    let app = h.load(id).await;
    assert_eq!(app.payment_history.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_review_and_cancellation_commit_exactly_one() {
    let h = Harness::new();
    let id = h.reviewing().await;
    let before = h.load(id).await;

    h.faults.hold_reads(2);
    let (reviewed, cancelled) = tokio::join!(
        h.review(id, ReviewStatus::Approved),
        h.service.cancel_application(h.applicant, id, Some("changed my mind".into())),
    );

    let (expected, loser) = match (reviewed, cancelled) {
        (Ok(_), Err(e)) => (ApplicationStatus::Auditing, e),
        (Err(e), Ok(_)) => (ApplicationStatus::Cancelled, e),
        (reviewed, cancelled) => {
            panic!("expected one winner, got {reviewed:?} and {cancelled:?}")
        }
    };
    assert_eq!(loser.kind(), "conflict");
    assert!(matches!(
        loser,
        WorkflowError::Conflict(ConflictError::ConcurrentModification { expected: stale, .. })
            if stale == before.version
    ));

    let after = h.load(id).await;
    assert_eq!(after.status, expected);
    assert_eq!(after.version, before.version + 1);
    assert_eq!(
        after.workflow_history.len(),
        before.workflow_history.len() + 1
    );
}
