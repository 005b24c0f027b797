//! Shared harness for the service integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use certflow_core::application::Application;
use certflow_core::capability::{Actor, Role};
use certflow_core::completeness::CompletenessPolicy;
use certflow_core::error::WorkflowError;
use certflow_core::ids::{ApplicationId, PaymentId, ProductId, UserId};
use certflow_core::payment::PaymentReason;
use certflow_core::records::{AuditResult, ReviewStatus};
use certflow_core::workflow::ApplicationStatus;
use certflow_runtime::service::{AuditInput, PaymentInput, PaymentOutcome, ReviewInput};
use certflow_runtime::{ApplicationService, CacheLayer, CacheSettings, Coordinator};
use certflow_testing::{
    Faults, FixedClock, InMemoryCache, InMemoryDocumentStore, InMemoryRelationalStore,
    InMemorySagaLog, MockCertificateIssuer, RecordingNotifier, fixtures, init_test_tracing,
    test_clock,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub type TestService =
    ApplicationService<InMemoryRelationalStore, InMemoryDocumentStore, InMemoryCache>;

pub struct Harness {
    pub service: TestService,
    pub relational: InMemoryRelationalStore,
    pub documents: InMemoryDocumentStore,
    pub cache: InMemoryCache,
    pub saga_log: InMemorySagaLog,
    pub faults: Faults,
    pub clock: FixedClock,
    pub notifier: RecordingNotifier,
    pub issuer: MockCertificateIssuer,
    pub applicant: Actor,
    pub reviewer: Actor,
    pub auditor: Actor,
    pub approver: Actor,
    pub admin: Actor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(CompletenessPolicy::default())
    }

    pub fn with_policy(policy: CompletenessPolicy) -> Self {
        init_test_tracing();

        let faults = Faults::new();
        let relational = InMemoryRelationalStore::with_faults(faults.clone());
        let documents = InMemoryDocumentStore::with_faults(faults.clone());
        let cache = InMemoryCache::with_faults(faults.clone());
        let saga_log = InMemorySagaLog::with_faults(faults.clone());
        let clock = test_clock();
        let notifier = RecordingNotifier::new();
        let issuer = MockCertificateIssuer::new();

        let coordinator = Coordinator::new(
            Arc::new(relational.clone()),
            Arc::new(documents.clone()),
            Arc::new(saga_log.clone()),
            Arc::new(clock.clone()),
        );
        let cache_layer = CacheLayer::new(
            cache.clone(),
            CacheSettings {
                timeout: Duration::from_millis(50),
                ..CacheSettings::default()
            },
        );
        let service = ApplicationService::new(
            coordinator,
            cache_layer,
            Arc::new(issuer.clone()),
            Arc::new(notifier.clone()),
            Arc::new(clock.clone()),
        )
        .with_policy(policy);

        Self {
            service,
            relational,
            documents,
            cache,
            saga_log,
            faults,
            clock,
            notifier,
            issuer,
            applicant: Actor::new(UserId::new(), Role::Applicant),
            reviewer: Actor::new(UserId::new(), Role::Reviewer),
            auditor: Actor::new(UserId::new(), Role::Auditor),
            approver: Actor::new(UserId::new(), Role::Approver),
            admin: Actor::new(UserId::new(), Role::Admin),
        }
    }

    /// Merged view as an admin sees it.
    pub async fn load(&self, id: ApplicationId) -> Application {
        self.service
            .get_application(self.admin, id)
            .await
            .unwrap()
    }

    pub async fn create(&self, form: Map<String, Value>) -> ApplicationId {
        self.service
            .create_application(self.applicant, ProductId::new(), form)
            .await
            .unwrap()
            .id
    }

    /// A complete application waiting for the initial fee.
    pub async fn submitted(&self) -> ApplicationId {
        let id = self.create(fixtures::complete_form()).await;
        self.service
            .submit_application(self.applicant, id)
            .await
            .unwrap();
        id
    }

    /// Record and confirm the fee the application is waiting on.
    pub async fn pay(&self, id: ApplicationId, reason: PaymentReason) -> Result<PaymentId, WorkflowError> {
        let payment = self
            .service
            .record_payment(
                self.applicant,
                id,
                PaymentInput {
                    reason,
                    amount: reason.fee(),
                    method: Some("card".into()),
                    gateway_reference: None,
                },
            )
            .await?;
        self.service
            .confirm_payment(
                self.admin,
                id,
                payment.id,
                PaymentOutcome::Completed,
                Some(format!("gw-{}", payment.id)),
            )
            .await?;
        Ok(payment.id)
    }

    /// An application under document review (initial fee paid).
    pub async fn reviewing(&self) -> ApplicationId {
        let id = self.submitted().await;
        self.pay(id, PaymentReason::Initial).await.unwrap();
        id
    }

    pub async fn review(&self, id: ApplicationId, status: ReviewStatus) -> Result<Application, WorkflowError> {
        self.service
            .submit_review(
                self.reviewer,
                id,
                ReviewInput {
                    status,
                    score: Some(80),
                    comments: Some(format!("review {status:?}")),
                    findings: Vec::new(),
                    final_rejection: false,
                },
            )
            .await
    }

    pub async fn resubmit(&self, id: ApplicationId) -> ApplicationStatus {
        self.service
            .submit_application(self.applicant, id)
            .await
            .unwrap()
            .status
    }

    pub async fn audit(&self, id: ApplicationId, result: AuditResult) -> Result<Application, WorkflowError> {
        self.service
            .submit_audit(
                self.auditor,
                id,
                AuditInput {
                    result,
                    score: Some(75),
                    findings: Vec::new(),
                    comments: None,
                },
            )
            .await
    }

    /// An application waiting for the approver.
    pub async fn approval_pending(&self) -> ApplicationId {
        let id = self.reviewing().await;
        self.review(id, ReviewStatus::Approved).await.unwrap();
        self.audit(id, AuditResult::Passed).await.unwrap();
        id
    }
}
