//! The certification workflow service.
//!
//! Every write follows the same path:
//!
//! 1. Authoritative re-read of the row and document (never the cache)
//! 2. Authorization against the capability matrix and the application
//! 3. A [`Change`] validating each transition and collecting the writes
//! 4. One saga through the [`Coordinator`], guarded by the row version
//! 5. Cache invalidation, reload and notifications
//!
//! # Example
//!
//! ```ignore
//! let created = service.create_application(applicant, product_id, form).await?;
//! let outcome = service.submit_application(applicant, created.id).await?;
//! assert_eq!(outcome.status, ApplicationStatus::PaymentPendingInitial);
//! ```

mod change;
mod types;

pub use types::{
    ApprovalInput, AttachmentInput, AuditInput, CreatedApplication, PaymentInput, PaymentOutcome,
    ProceedCheck, ReviewInput, SubmissionOutcome, UpdatedFields,
};

use crate::cache::{CacheLayer, STATS_PREFIX, application_key, stats_key};
use crate::coordinator::{Coordinator, RecoveryReport};
use crate::metrics::WorkflowMetrics;
use certflow_core::application::{
    APPLICATIONS_COLLECTION, Application, ApplicationDocument, ApplicationRow, generate_code,
};
use certflow_core::capability::{Action, Actor, Role, StaffAssignments, StaffRole, authorize};
use certflow_core::collaborators::{CertificateIssuer, CertificateOptions, Notification, Notifier};
use certflow_core::completeness::CompletenessPolicy;
use certflow_core::environment::Clock;
use certflow_core::error::{ConflictError, StoreError, StoreKind, WorkflowError};
use certflow_core::ids::{ApplicationId, PaymentId, ProductId, RecordId, TransactionId};
use certflow_core::payment::{PaymentRecord, PaymentRequirement, PaymentStatus, PaymentType};
use certflow_core::records::{
    ApprovalDecision, ApprovalRecord, AttachmentRef, AuditKind, AuditRecord, AuditResult,
    ReviewRecord, ReviewStatus,
};
use certflow_core::saga::{SagaEntry, SagaPlan, SagaReceipt};
use certflow_core::store::{
    ApplicationStats, Cache, DocumentOp, DocumentStore, Pagination, RelationalOp, RelationalStore,
    SearchFilter, SearchResults, StatsFilter, path,
};
use certflow_core::workflow::{
    ApplicationStatus, NextStageInfo, Stage, Timeline, evaluate_transition, next_stage_info,
    next_status, next_steps,
};
use change::{Change, Edge, to_json};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Target of the notification log sink.
pub const NOTIFICATION_TARGET: &str = "certflow::notifications";

/// Workflow operations over the hybrid store.
pub struct ApplicationService<R, D, C> {
    coordinator: Coordinator<R, D>,
    cache: CacheLayer<C>,
    issuer: Arc<dyn CertificateIssuer>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: CompletenessPolicy,
}

impl<R, D, C> ApplicationService<R, D, C>
where
    R: RelationalStore,
    D: DocumentStore,
    C: Cache,
{
    /// Create a service with the default completeness policy.
    #[must_use]
    pub fn new(
        coordinator: Coordinator<R, D>,
        cache: CacheLayer<C>,
        issuer: Arc<dyn CertificateIssuer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            cache,
            issuer,
            notifier,
            clock,
            policy: CompletenessPolicy::default(),
        }
    }

    /// Replace the completeness policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CompletenessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The saga coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator<R, D> {
        &self.coordinator
    }

    /// The cache layer.
    #[must_use]
    pub const fn cache(&self) -> &CacheLayer<C> {
        &self.cache
    }

    // ═══════════════════════════════════════════════════════════
    // Plumbing
    // ═══════════════════════════════════════════════════════════

    /// Authoritative read of both halves of an application.
    async fn load(&self, id: ApplicationId) -> Result<(ApplicationRow, Application), WorkflowError> {
        let row = self
            .coordinator
            .relational()
            .fetch_application(id)
            .await?
            .ok_or_else(|| WorkflowError::application_not_found(id))?;

        let raw = self
            .coordinator
            .documents()
            .get(APPLICATIONS_COLLECTION, &row.document_id)
            .await?
            .ok_or_else(|| {
                StoreError::new(
                    StoreKind::Document,
                    format!("document {APPLICATIONS_COLLECTION}/{} not found", row.document_id),
                )
            })?;
        let document: ApplicationDocument = serde_json::from_value(raw).map_err(|e| {
            StoreError::new(
                StoreKind::Document,
                format!("malformed document {APPLICATIONS_COLLECTION}/{}: {e}", row.document_id),
            )
        })?;

        let application = Application::from_parts(row.clone(), document);
        Ok((row, application))
    }

    /// Load and authorize in one step.
    async fn load_for(
        &self,
        actor: &Actor,
        action: Action,
        id: ApplicationId,
    ) -> Result<(ApplicationRow, Application), WorkflowError> {
        actor.require(action)?;
        let (row, application) = self.load(id).await?;
        authorize(actor, action, application.user_id, &application.assignments)?;
        Ok((row, application))
    }

    /// Run a change as one saga, then invalidate, reload and notify.
    async fn commit(
        &self,
        change: Change<'_>,
        label: &str,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<Application, WorkflowError> {
        let (plan, edges) = change.into_plan(label);
        let receipt = match self.coordinator.execute(plan).await {
            Ok(receipt) => receipt,
            Err(e @ WorkflowError::PartialCommit(_)) => {
                // The row changed even though the document did not
                self.cache.invalidate_application(id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.cache.invalidate_application(id).await;

        let (_, application) = self.load(id).await?;
        for (from, to) in &edges {
            WorkflowMetrics::record_transition(from.as_str(), to.as_str());
            tracing::info!(
                application_id = %id,
                transaction_id = %receipt.transaction_id,
                from = %from,
                to = %to,
                actor_id = %actor.id,
                actor_role = %actor.role,
                "Application transitioned"
            );
        }
        self.dispatch(&application, &edges, actor);
        Ok(application)
    }

    /// Fire-and-forget notifications, one per target state.
    fn dispatch(&self, application: &Application, edges: &[Edge], actor: Actor) {
        let at = self.clock.now();
        for &(_, target_state) in edges {
            tracing::info!(
                target: NOTIFICATION_TARGET,
                application_id = %application.id,
                code = %application.code,
                user_id = %application.user_id,
                target_state = %target_state,
                actor_id = %actor.id,
                actor_role = %actor.role,
                "Workflow notification"
            );
            let notifier = Arc::clone(&self.notifier);
            let notification = Notification {
                application: application.clone(),
                target_state,
                actor,
                at,
            };
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(notification).await {
                    tracing::warn!(target: NOTIFICATION_TARGET, error = %e, "Notification delivery failed");
                }
            });
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Applications
    // ═══════════════════════════════════════════════════════════

    /// Create a draft owned by `actor`.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Authorization`] if the role may not create
    /// - Store errors from the creating saga
    #[tracing::instrument(skip(self, form_data), fields(actor_id = %actor.id))]
    pub async fn create_application(
        &self,
        actor: Actor,
        product_id: ProductId,
        form_data: Map<String, Value>,
    ) -> Result<CreatedApplication, WorkflowError> {
        actor.require(Action::Create)?;

        let now = self.clock.now();
        let id = ApplicationId::new();
        let completeness = self.policy.evaluate(&form_data);
        let row = ApplicationRow {
            id,
            code: generate_code(now),
            user_id: actor.id,
            product_id,
            status: ApplicationStatus::Draft,
            stage: Stage::Application,
            completeness_score: completeness.score,
            rejection_count: 0,
            total_payments: 0,
            assignments: StaffAssignments::default(),
            certificate_number: None,
            document_id: id.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let document = ApplicationDocument {
            form_data,
            timeline: Timeline {
                created_at: Some(now),
                ..Timeline::default()
            },
            ..ApplicationDocument::default()
        };

        let plan = SagaPlan::new("create_application")
            .relational(RelationalOp::InsertApplication { row: row.clone() })
            .document(DocumentOp::Insert {
                collection: APPLICATIONS_COLLECTION.to_string(),
                id: row.document_id.clone(),
                document: to_json(&document)?,
            });
        self.coordinator.execute(plan).await?;
        self.cache.invalidate_prefix(STATS_PREFIX).await;

        tracing::info!(application_id = %id, code = %row.code, "Application created");
        Ok(CreatedApplication {
            id,
            code: row.code,
            status: ApplicationStatus::Draft,
        })
    }

    /// Read the merged application, served from cache when possible.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown id
    /// - [`WorkflowError::Authorization`] if the actor may not view it
    pub async fn get_application(
        &self,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<Application, WorkflowError> {
        actor.require(Action::View)?;

        let key = application_key(id);
        if let Some(application) = self.cache.get_json::<Application>(&key).await {
            authorize(&actor, Action::View, application.user_id, &application.assignments)?;
            return Ok(application);
        }

        let (row, application) = self.load(id).await?;
        authorize(&actor, Action::View, application.user_id, &application.assignments)?;

        // A write that committed since the read has already invalidated the
        // key; caching this copy would resurrect the old version.
        let current = self.coordinator.relational().fetch_application(id).await;
        if matches!(current, Ok(Some(ref latest)) if latest.version == row.version) {
            self.cache
                .set_json(&key, &application, self.cache.settings().application_ttl)
                .await;
        } else {
            tracing::debug!(application_id = %id, "Application changed during read, not cached");
        }
        Ok(application)
    }

    /// Change form fields of a draft or rejected application.
    ///
    /// Each changed top-level field is written separately with its previous
    /// value. The completeness score is recomputed.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Validation`] for an empty update
    /// - [`ConflictError::InvalidState`] outside `draft` and `rejected`
    #[tracing::instrument(skip(self, updates), fields(actor_id = %actor.id))]
    pub async fn update_application(
        &self,
        actor: Actor,
        id: ApplicationId,
        updates: Map<String, Value>,
    ) -> Result<UpdatedFields, WorkflowError> {
        if updates.is_empty() {
            return Err(WorkflowError::Validation("no fields to update".into()));
        }
        let (row, application) = self.load_for(&actor, Action::EditForm, id).await?;
        if !matches!(
            application.status,
            ApplicationStatus::Draft | ApplicationStatus::Rejected
        ) {
            return Err(ConflictError::InvalidState {
                operation: "edit form".into(),
                status: application.status,
            }
            .into());
        }

        let mut change = Change::new(&row, &application, actor, self.clock.now());
        let mut form = application.form_data.clone();
        let mut updated_fields = Vec::new();
        for (field, value) in updates {
            let previous = application.form_data.get(&field).cloned();
            if previous.as_ref() == Some(&value) {
                continue;
            }
            change.set(
                vec!["formData".to_string(), field.clone()],
                value.clone(),
                previous,
            );
            form.insert(field.clone(), value);
            updated_fields.push(field);
        }

        let score = self.policy.evaluate(&form).score;
        if change.is_empty() {
            return Ok(UpdatedFields {
                id,
                updated_fields,
                completeness_score: score,
            });
        }
        if score != row.completeness_score {
            change.patch_mut().completeness_score = Some(score);
        }

        self.commit(change, "update_application", actor, id).await?;
        Ok(UpdatedFields {
            id,
            updated_fields,
            completeness_score: score,
        })
    }

    /// Submit a draft or resubmit a rejected application.
    ///
    /// From `draft` the application moves to `submitted` and on to
    /// `payment_pending_1`. From `rejected` it returns to `reviewing`, or to
    /// `payment_pending_2` once two reviews were rejected.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::Incomplete`] below the completeness threshold
    /// - [`ConflictError::InvalidState`] from any other status
    #[tracing::instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn submit_application(
        &self,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<SubmissionOutcome, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Submit, id).await?;
        if !matches!(
            application.status,
            ApplicationStatus::Draft | ApplicationStatus::Rejected
        ) {
            return Err(ConflictError::InvalidState {
                operation: "submit".into(),
                status: application.status,
            }
            .into());
        }

        let completeness = self.policy.evaluate(&application.form_data);
        if !self.policy.passes(completeness.score) {
            return Err(ConflictError::Incomplete {
                score: completeness.score,
                threshold: self.policy.threshold(),
                missing: completeness.missing,
            }
            .into());
        }

        let mut change = Change::new(&row, &application, actor, self.clock.now());
        if completeness.score != row.completeness_score {
            change.patch_mut().completeness_score = Some(completeness.score);
        }
        if application.status == ApplicationStatus::Draft {
            change.transition(ApplicationStatus::Submitted, "submit", None, None)?;
            change.transition(ApplicationStatus::PaymentPendingInitial, "submit", None, None)?;
        } else {
            let target = next_status(&application.workflow_snapshot())
                .unwrap_or(ApplicationStatus::Reviewing);
            change.transition(target, "resubmit", None, None)?;
        }

        let status = change.status();
        self.commit(change, "submit_application", actor, id).await?;
        Ok(SubmissionOutcome {
            status,
            next_steps: next_steps(status),
        })
    }

    /// Filtered, paginated search. Applicants only ever see their own
    /// applications. Free text is matched against document content.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Validation`] for a bad page request
    /// - Store errors from either query
    pub async fn search_applications(
        &self,
        actor: Actor,
        mut filter: SearchFilter,
        pagination: Pagination,
    ) -> Result<SearchResults, WorkflowError> {
        actor.require(Action::Search)?;
        let pagination = pagination.validate()?;
        if actor.role == Role::Applicant {
            filter.user_id = Some(actor.id);
        }

        let mut free_text_match_count = None;
        if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let matches = self
                .coordinator
                .documents()
                .search_text(APPLICATIONS_COLLECTION, text)
                .await?;
            free_text_match_count = Some(u64::try_from(matches.len()).unwrap_or(u64::MAX));
            let ids: Vec<ApplicationId> = matches.iter().filter_map(|id| id.parse().ok()).collect();
            filter.ids = Some(match filter.ids.take() {
                Some(existing) => existing.into_iter().filter(|id| ids.contains(id)).collect(),
                None => ids,
            });
        }

        let page = self.coordinator.relational().search(&filter, pagination).await?;
        Ok(SearchResults {
            rows: page.rows,
            pagination: pagination.meta(page.total),
            free_text_match_count,
        })
    }

    /// Aggregate counts, cached per filter.
    ///
    /// # Errors
    ///
    /// Returns store errors from the aggregate query.
    pub async fn get_application_stats(
        &self,
        actor: Actor,
        filter: StatsFilter,
    ) -> Result<ApplicationStats, WorkflowError> {
        actor.require(Action::ViewStats)?;

        let key = stats_key(&filter);
        if let Some(stats) = self.cache.get_json::<ApplicationStats>(&key).await {
            return Ok(stats);
        }
        let stats = self.coordinator.relational().stats(&filter).await?;
        self.cache
            .set_json(&key, &stats, self.cache.settings().stats_ttl)
            .await;
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════
    // Workflow queries (authoritative)
    // ═══════════════════════════════════════════════════════════

    /// Where the application goes next and whether a payment is due.
    ///
    /// # Errors
    ///
    /// Not found and authorization errors.
    pub async fn get_next_stage_info(
        &self,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<NextStageInfo, WorkflowError> {
        let (_, application) = self.load_for(&actor, Action::View, id).await?;
        Ok(next_stage_info(&application.workflow_snapshot()))
    }

    /// The payment the application is waiting on, if any.
    ///
    /// # Errors
    ///
    /// Not found and authorization errors.
    pub async fn payment_required(
        &self,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<Option<PaymentRequirement>, WorkflowError> {
        let (_, application) = self.load_for(&actor, Action::View, id).await?;
        Ok(certflow_core::workflow::payment_required(
            &application.workflow_snapshot(),
        ))
    }

    /// Whether the happy-path transition would be accepted right now.
    ///
    /// # Errors
    ///
    /// Not found and authorization errors.
    pub async fn can_proceed_to_next_stage(
        &self,
        actor: Actor,
        id: ApplicationId,
    ) -> Result<ProceedCheck, WorkflowError> {
        let (_, application) = self.load_for(&actor, Action::View, id).await?;
        let snapshot = application.workflow_snapshot();
        let next = next_status(&snapshot);

        let score = self.policy.evaluate(&application.form_data).score;
        let verdict = match next {
            None => Err(ConflictError::TerminalState {
                status: snapshot.status,
            }
            .to_string()),
            Some(ApplicationStatus::Submitted) if !self.policy.passes(score) => Err(format!(
                "completeness {score} below threshold {}",
                self.policy.threshold()
            )),
            Some(to) => evaluate_transition(
                &snapshot,
                to,
                &application.payment_history,
                &application.workflow_history,
            )
            .map_err(|e| e.to_string()),
        };

        Ok(ProceedCheck {
            current: snapshot.status,
            next,
            can_proceed: verdict.is_ok(),
            reason: verdict.err(),
        })
    }

    // ═══════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════

    /// Move the application to `to`.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::IllegalTransition`], [`ConflictError::TerminalState`]
    /// - [`ConflictError::PaymentRequired`] for an unpaid gate
    /// - [`ConflictError::ConcurrentModification`] if another writer won
    #[tracing::instrument(skip(self, comments), fields(actor_id = %actor.id))]
    pub async fn transition(
        &self,
        actor: Actor,
        id: ApplicationId,
        to: ApplicationStatus,
        comments: Option<String>,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Transition, id).await?;
        let mut change = Change::new(&row, &application, actor, self.clock.now());
        change.transition(to, "transition", comments, None)?;
        self.commit(change, "transition", actor, id).await
    }

    /// Take the happy-path transition from the current status.
    ///
    /// Submission and certificate issue have dedicated operations and are
    /// refused here.
    ///
    /// # Errors
    ///
    /// As for [`transition`](Self::transition), plus
    /// [`ConflictError::InvalidState`] from `draft` and `approved`.
    pub async fn advance(
        &self,
        actor: Actor,
        id: ApplicationId,
        comments: Option<String>,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Transition, id).await?;
        let snapshot = application.workflow_snapshot();
        if matches!(
            snapshot.status,
            ApplicationStatus::Draft | ApplicationStatus::Approved
        ) {
            return Err(ConflictError::InvalidState {
                operation: "advance".into(),
                status: snapshot.status,
            }
            .into());
        }
        let to = next_status(&snapshot).ok_or(ConflictError::TerminalState {
            status: snapshot.status,
        })?;

        let mut change = Change::new(&row, &application, actor, self.clock.now());
        change.transition(to, "advance", comments, None)?;
        self.commit(change, "advance", actor, id).await
    }

    /// Cancel a non-terminal application.
    ///
    /// # Errors
    ///
    /// [`ConflictError::TerminalState`] for a closed application.
    #[tracing::instrument(skip(self, reason), fields(actor_id = %actor.id))]
    pub async fn cancel_application(
        &self,
        actor: Actor,
        id: ApplicationId,
        reason: Option<String>,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Cancel, id).await?;
        let mut change = Change::new(&row, &application, actor, self.clock.now());
        change.transition(ApplicationStatus::Cancelled, "cancel", reason, None)?;
        self.commit(change, "cancel_application", actor, id).await
    }

    // ═══════════════════════════════════════════════════════════
    // Payments
    // ═══════════════════════════════════════════════════════════

    /// Record a pending payment for the fee the application is waiting on.
    ///
    /// When the fee is due but the application is not yet in the matching
    /// `payment_pending_*` state (`rejected` after two rejections,
    /// `audit_failed`, `audit_doubt`), it is moved there first.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Validation`] for a wrong reason or amount, or a
    ///   payment already pending for the same fee
    /// - [`ConflictError::InvalidState`] when no payment is due
    #[tracing::instrument(skip(self, input), fields(actor_id = %actor.id, reason = %input.reason))]
    pub async fn record_payment(
        &self,
        actor: Actor,
        id: ApplicationId,
        input: PaymentInput,
    ) -> Result<PaymentRecord, WorkflowError> {
        let fee = input.reason.fee();
        if input.amount != fee {
            return Err(WorkflowError::Validation(format!(
                "amount {} does not match the {} fee of {fee}",
                input.amount, input.reason
            )));
        }

        let (row, application) = self.load_for(&actor, Action::RecordPayment, id).await?;
        if application.status.is_terminal() {
            return Err(ConflictError::TerminalState {
                status: application.status,
            }
            .into());
        }
        let Some(requirement) =
            certflow_core::workflow::payment_required(&application.workflow_snapshot())
        else {
            return Err(ConflictError::InvalidState {
                operation: "record payment".into(),
                status: application.status,
            }
            .into());
        };
        if requirement.reason != input.reason {
            return Err(WorkflowError::Validation(format!(
                "application is waiting for a {} payment, not {}",
                requirement.reason, input.reason
            )));
        }
        if application.payment_history.iter().any(|p| {
            p.reason == input.reason
                && p.payment_type == PaymentType::Charge
                && p.status == PaymentStatus::Pending
        }) {
            return Err(WorkflowError::Validation(format!(
                "a {} payment is already pending",
                input.reason
            )));
        }

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let pending_state = input.reason.pending_state();
        if change.status() != pending_state {
            change.transition(pending_state, "record_payment", None, None)?;
        }
        let record = PaymentRecord {
            id: PaymentId::new(),
            amount: input.amount,
            payment_type: PaymentType::Charge,
            reason: input.reason,
            status: PaymentStatus::Pending,
            gateway_reference: input.gateway_reference,
            method: input.method,
            refund_of: None,
            created_at: now,
            completed_at: None,
        };
        change.push_payment(record.clone())?;

        self.commit(change, "record_payment", actor, id).await?;
        tracing::info!(application_id = %id, payment_id = %record.id, amount = record.amount, "Payment recorded");
        Ok(record)
    }

    /// Settle a pending payment.
    ///
    /// A completed payment is added to `total_payments`. If the application
    /// is waiting in the payment's pending state, the gate it unlocks is taken
    /// in the same saga.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown payment
    /// - [`WorkflowError::Validation`] if the payment is not a pending charge
    #[tracing::instrument(skip(self, gateway_reference), fields(actor_id = %actor.id))]
    pub async fn confirm_payment(
        &self,
        actor: Actor,
        id: ApplicationId,
        payment_id: PaymentId,
        outcome: PaymentOutcome,
        gateway_reference: Option<String>,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::ConfirmPayment, id).await?;
        let (index, payment) = find_payment(&application, payment_id)?;
        if payment.payment_type != PaymentType::Charge || payment.status != PaymentStatus::Pending {
            return Err(WorkflowError::Validation(format!(
                "payment {payment_id} is {}, only pending charges can be confirmed",
                payment.status.as_str()
            )));
        }

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let mut settled = payment.clone();
        settled.status = match outcome {
            PaymentOutcome::Completed => PaymentStatus::Completed,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        };
        settled.completed_at = Some(now);
        if gateway_reference.is_some() {
            settled.gateway_reference = gateway_reference;
        }
        change.replace_payment(index, settled.clone())?;

        if outcome == PaymentOutcome::Completed {
            change.patch_mut().total_payments = Some(row.total_payments + settled.amount);
            let (from, to) = settled.reason.gate_edge();
            if change.status() == from {
                change.transition(
                    to,
                    "confirm_payment",
                    None,
                    Some(json!({ "paymentId": payment_id })),
                )?;
            }
        }

        self.commit(change, "confirm_payment", actor, id).await
    }

    /// Refund a completed charge.
    ///
    /// The charge and a negative refund record both end up `refunded`;
    /// `total_payments` drops by the charged amount.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown payment
    /// - [`WorkflowError::Validation`] if the payment is not a completed charge
    #[tracing::instrument(skip(self, reason), fields(actor_id = %actor.id))]
    pub async fn refund_payment(
        &self,
        actor: Actor,
        id: ApplicationId,
        payment_id: PaymentId,
        reason: Option<String>,
    ) -> Result<PaymentRecord, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::RefundPayment, id).await?;
        let (index, payment) = find_payment(&application, payment_id)?;
        if payment.payment_type != PaymentType::Charge || payment.status != PaymentStatus::Completed {
            return Err(WorkflowError::Validation(format!(
                "payment {payment_id} is {}, only completed charges can be refunded",
                payment.status.as_str()
            )));
        }

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let mut refunded = payment.clone();
        refunded.status = PaymentStatus::Refunded;
        change.replace_payment(index, refunded)?;

        let refund = PaymentRecord {
            id: PaymentId::new(),
            amount: -payment.amount,
            payment_type: PaymentType::Refund,
            reason: payment.reason,
            status: PaymentStatus::Refunded,
            gateway_reference: None,
            method: payment.method.clone(),
            refund_of: Some(payment_id),
            created_at: now,
            completed_at: Some(now),
        };
        change.push_payment(refund.clone())?;
        change.patch_mut().total_payments = Some(row.total_payments - payment.amount);

        self.commit(change, "refund_payment", actor, id).await?;
        tracing::info!(
            application_id = %id,
            %payment_id,
            amount = payment.amount,
            reason = reason.as_deref().unwrap_or(""),
            "Payment refunded"
        );
        Ok(refund)
    }

    // ═══════════════════════════════════════════════════════════
    // Staff work
    // ═══════════════════════════════════════════════════════════

    /// Put a staff member in the reviewer, auditor or approver slot.
    ///
    /// `staff` is the member as resolved by the caller's user directory.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Validation`] if `staff` does not hold the slot's role
    /// - [`ConflictError::TerminalState`] for a closed application
    pub async fn assign_staff(
        &self,
        actor: Actor,
        id: ApplicationId,
        role: StaffRole,
        staff: Actor,
    ) -> Result<Application, WorkflowError> {
        if staff.role != role.required_role() {
            return Err(WorkflowError::Validation(format!(
                "user {} is a {}, not a {}",
                staff.id,
                staff.role,
                role.required_role()
            )));
        }
        let staff_id = staff.id;
        let (row, application) = self.load_for(&actor, Action::AssignStaff, id).await?;
        if application.status.is_terminal() {
            return Err(ConflictError::TerminalState {
                status: application.status,
            }
            .into());
        }

        let mut change = Change::new(&row, &application, actor, self.clock.now());
        let patch = change.patch_mut();
        match role {
            StaffRole::Reviewer => patch.reviewer_id = Some(Some(staff_id)),
            StaffRole::Auditor => patch.auditor_id = Some(Some(staff_id)),
            StaffRole::Approver => patch.approver_id = Some(Some(staff_id)),
        }
        tracing::info!(application_id = %id, ?role, %staff_id, "Staff assigned");
        self.commit(change, "assign_staff", actor, id).await
    }

    /// Record a document review.
    ///
    /// An approval moves the application to `auditing`. A rejection bumps
    /// `rejection_count` and moves it to `rejected` (or `rejected_final`).
    /// An unassigned reviewer slot is claimed by the acting reviewer.
    ///
    /// # Errors
    ///
    /// [`ConflictError::InvalidState`] unless the application is `reviewing`.
    #[tracing::instrument(skip(self, input), fields(actor_id = %actor.id))]
    pub async fn submit_review(
        &self,
        actor: Actor,
        id: ApplicationId,
        input: ReviewInput,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Review, id).await?;
        if application.status != ApplicationStatus::Reviewing {
            return Err(ConflictError::InvalidState {
                operation: "review".into(),
                status: application.status,
            }
            .into());
        }
        validate_score(input.score)?;

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let record = ReviewRecord {
            id: RecordId::new(),
            round: round(application.reviews.len()),
            reviewer_id: actor.id,
            status: input.status,
            score: input.score,
            comments: input.comments.clone(),
            findings: input.findings,
            reviewed_at: now,
        };
        change.push(path(["reviews"]), to_json(&record)?);
        if actor.role == Role::Reviewer && application.assignments.reviewer_id.is_none() {
            change.patch_mut().reviewer_id = Some(Some(actor.id));
        }

        match input.status {
            ReviewStatus::Approved => {
                change.transition(ApplicationStatus::Auditing, "review", input.comments, None)?;
            }
            ReviewStatus::Rejected => {
                change.set_rejection_count(application.rejected_reviews() + 1);
                let target = if input.final_rejection {
                    ApplicationStatus::RejectedFinal
                } else {
                    ApplicationStatus::Rejected
                };
                change.transition(target, "review", input.comments, None)?;
            }
        }

        self.commit(change, "submit_review", actor, id).await
    }

    /// Record an audit. The kind follows from the current status.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::InvalidState`] outside the auditing states
    /// - [`ConflictError::IllegalTransition`] for a result the current audit
    ///   cannot produce (an inconclusive field audit)
    #[tracing::instrument(skip(self, input), fields(actor_id = %actor.id))]
    pub async fn submit_audit(
        &self,
        actor: Actor,
        id: ApplicationId,
        input: AuditInput,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Audit, id).await?;
        let kind = match application.status {
            ApplicationStatus::Auditing => AuditKind::Document,
            ApplicationStatus::ReAuditing => AuditKind::ReAudit,
            ApplicationStatus::FieldAuditing => AuditKind::Field,
            status => {
                return Err(ConflictError::InvalidState {
                    operation: "audit".into(),
                    status,
                }
                .into());
            }
        };
        validate_score(input.score)?;

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let record = AuditRecord {
            id: RecordId::new(),
            round: round(application.audits.len()),
            auditor_id: actor.id,
            kind,
            result: input.result,
            score: input.score,
            findings: input.findings,
            audited_at: now,
        };
        change.push(path(["audits"]), to_json(&record)?);
        change.set_last_audit(input.result);
        if actor.role == Role::Auditor && application.assignments.auditor_id.is_none() {
            change.patch_mut().auditor_id = Some(Some(actor.id));
        }

        let target = match input.result {
            AuditResult::Passed => ApplicationStatus::ApprovalPending,
            AuditResult::Failed => ApplicationStatus::AuditFailed,
            AuditResult::Doubt => ApplicationStatus::AuditDoubt,
        };
        change.transition(target, "audit", input.comments, None)?;

        self.commit(change, "submit_audit", actor, id).await
    }

    /// Record the approval decision.
    ///
    /// # Errors
    ///
    /// [`ConflictError::InvalidState`] unless the application is
    /// `approval_pending`.
    #[tracing::instrument(skip(self, input), fields(actor_id = %actor.id))]
    pub async fn decide_approval(
        &self,
        actor: Actor,
        id: ApplicationId,
        input: ApprovalInput,
    ) -> Result<Application, WorkflowError> {
        let (row, application) = self.load_for(&actor, Action::Approve, id).await?;
        if application.status != ApplicationStatus::ApprovalPending {
            return Err(ConflictError::InvalidState {
                operation: "decide approval".into(),
                status: application.status,
            }
            .into());
        }

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let record = ApprovalRecord {
            approver_id: actor.id,
            decision: input.decision,
            comments: input.comments.clone(),
            decided_at: now,
        };
        let previous = application.approval.as_ref().map(to_json).transpose()?;
        change.set(path(["approval"]), to_json(&record)?, previous);
        if actor.role == Role::Approver && application.assignments.approver_id.is_none() {
            change.patch_mut().approver_id = Some(Some(actor.id));
        }

        let target = match input.decision {
            ApprovalDecision::Approved => ApplicationStatus::Approved,
            ApprovalDecision::Rejected => ApplicationStatus::RejectedFinal,
        };
        change.transition(target, "approve", input.comments, None)?;

        self.commit(change, "decide_approval", actor, id).await
    }

    /// Issue the certificate of an approved application.
    ///
    /// The issuer is called before any write; its failure leaves the
    /// application `approved`. If the write then fails, the issued number is
    /// logged at `warn` for reconciliation with the issuer.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::InvalidState`] unless the application is `approved`
    /// - [`WorkflowError::External`] if the certificate service fails
    #[tracing::instrument(skip(self, options), fields(actor_id = %actor.id))]
    pub async fn issue_certificate(
        &self,
        actor: Actor,
        id: ApplicationId,
        options: CertificateOptions,
    ) -> Result<Application, WorkflowError> {
        if options.validity_years == 0 {
            return Err(WorkflowError::Validation(
                "certificate validity must be at least one year".into(),
            ));
        }
        let (row, application) = self.load_for(&actor, Action::IssueCertificate, id).await?;
        if application.status != ApplicationStatus::Approved {
            return Err(ConflictError::InvalidState {
                operation: "issue certificate".into(),
                status: application.status,
            }
            .into());
        }

        let mut change = Change::new(&row, &application, actor, self.clock.now());
        change.transition(ApplicationStatus::CertificateIssued, "issue_certificate", None, None)?;

        let certificate = self.issuer.issue(application.clone(), options).await?;
        let previous = application.certificate.as_ref().map(to_json).transpose()?;
        change.set(path(["certificate"]), to_json(&certificate)?, previous);
        change.patch_mut().certificate_number = Some(Some(certificate.certificate_number.clone()));

        match self.commit(change, "issue_certificate", actor, id).await {
            Ok(application) => {
                tracing::info!(
                    application_id = %id,
                    certificate_number = %certificate.certificate_number,
                    "Certificate issued"
                );
                Ok(application)
            }
            Err(e) => {
                // The issuer has no undo; the number is only in this log
                tracing::warn!(
                    application_id = %id,
                    certificate_number = %certificate.certificate_number,
                    error = %e,
                    "Certificate issued but not recorded, reconcile with the issuer"
                );
                Err(e)
            }
        }
    }

    /// Reference an artifact stored by the file service.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Validation`] for a blank file id or category
    /// - [`ConflictError::TerminalState`] for a closed application
    pub async fn attach_document(
        &self,
        actor: Actor,
        id: ApplicationId,
        input: AttachmentInput,
    ) -> Result<AttachmentRef, WorkflowError> {
        if input.file_id.trim().is_empty() || input.category.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "attachment needs a file id and a category".into(),
            ));
        }
        let (row, application) = self.load_for(&actor, Action::AttachDocument, id).await?;
        if application.status.is_terminal() {
            return Err(ConflictError::TerminalState {
                status: application.status,
            }
            .into());
        }

        let now = self.clock.now();
        let mut change = Change::new(&row, &application, actor, now);
        let attachment = AttachmentRef {
            file_id: input.file_id,
            category: input.category,
            path: input.path,
            uploaded_by: actor.id,
            attached_at: now,
        };
        change.push(path(["attachments"]), to_json(&attachment)?);

        self.commit(change, "attach_document", actor, id).await?;
        Ok(attachment)
    }

    // ═══════════════════════════════════════════════════════════
    // Saga administration
    // ═══════════════════════════════════════════════════════════

    /// Compensate a partial commit. Every cached application and statistic is
    /// dropped afterwards.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::reconcile`].
    pub async fn reconcile(
        &self,
        actor: Actor,
        transaction_id: TransactionId,
    ) -> Result<SagaReceipt, WorkflowError> {
        actor.require(Action::Reconcile)?;
        let receipt = self.coordinator.reconcile(transaction_id).await?;
        self.cache.invalidate_prefix("application:").await;
        self.cache.invalidate_prefix(STATS_PREFIX).await;
        Ok(receipt)
    }

    /// Settle sagas interrupted by a crash.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::recover_interrupted`].
    pub async fn recover_interrupted(
        &self,
        actor: Actor,
        older_than: chrono::Duration,
    ) -> Result<RecoveryReport, WorkflowError> {
        actor.require(Action::Reconcile)?;
        self.coordinator.recover_interrupted(older_than).await
    }

    /// Close a saga manually.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::mark_resolved`].
    pub async fn mark_resolved(
        &self,
        actor: Actor,
        transaction_id: TransactionId,
        notes: Option<String>,
    ) -> Result<(), WorkflowError> {
        actor.require(Action::Reconcile)?;
        self.coordinator
            .mark_resolved(transaction_id, actor.id, notes)
            .await
    }

    /// Partial commits awaiting reconciliation.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::unresolved`].
    pub async fn unresolved(&self, actor: Actor, limit: i64) -> Result<Vec<SagaEntry>, WorkflowError> {
        actor.require(Action::Reconcile)?;
        self.coordinator.unresolved(limit).await
    }
}

fn find_payment(
    application: &Application,
    payment_id: PaymentId,
) -> Result<(usize, &PaymentRecord), WorkflowError> {
    application
        .payment_history
        .iter()
        .enumerate()
        .find(|(_, payment)| payment.id == payment_id)
        .ok_or_else(|| WorkflowError::NotFound {
            entity: "payment",
            id: payment_id.to_string(),
        })
}

fn validate_score(score: Option<u8>) -> Result<(), WorkflowError> {
    match score {
        Some(score) if score > 100 => Err(WorkflowError::Validation(format!(
            "score {score} is above 100"
        ))),
        _ => Ok(()),
    }
}

/// 1-based round following `existing` records.
fn round(existing: usize) -> u32 {
    u32::try_from(existing).map_or(u32::MAX, |n| n.saturating_add(1))
}
