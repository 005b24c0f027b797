//! Role x Action capability matrix and per-application access rules.
//!
//! The matrix is an exhaustive `match`: adding a [`Role`] or an [`Action`]
//! does not compile until every pair has been decided.

use crate::error::WorkflowError;
use crate::ids::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capacity in which a user acts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Producer applying for certification
    Applicant,
    /// Staff reviewing submitted documents
    Reviewer,
    /// Staff performing audits
    Auditor,
    /// Staff granting final approval
    Approver,
    /// Operator with full access
    Admin,
}

impl Role {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applicant => "applicant",
            Self::Reviewer => "reviewer",
            Self::Auditor => "auditor",
            Self::Approver => "approver",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation requested against an application (or the application set).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a draft
    Create,
    /// Read one application
    View,
    /// Change form data
    EditForm,
    /// Submit or resubmit
    Submit,
    /// Record a payment attempt
    RecordPayment,
    /// Confirm a pending payment (gateway callback)
    ConfirmPayment,
    /// Refund a completed payment
    RefundPayment,
    /// Assign reviewer, auditor or approver
    AssignStaff,
    /// Record a document review
    Review,
    /// Record an audit
    Audit,
    /// Record the approval decision
    Approve,
    /// Issue the certificate
    IssueCertificate,
    /// Cancel the application
    Cancel,
    /// Force a workflow transition
    Transition,
    /// Attach an uploaded artifact
    AttachDocument,
    /// Search applications
    Search,
    /// Read aggregate statistics
    ViewStats,
    /// Reconcile partially committed sagas
    Reconcile,
}

impl Action {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::View => "view",
            Self::EditForm => "edit_form",
            Self::Submit => "submit",
            Self::RecordPayment => "record_payment",
            Self::ConfirmPayment => "confirm_payment",
            Self::RefundPayment => "refund_payment",
            Self::AssignStaff => "assign_staff",
            Self::Review => "review",
            Self::Audit => "audit",
            Self::Approve => "approve",
            Self::IssueCertificate => "issue_certificate",
            Self::Cancel => "cancel",
            Self::Transition => "transition",
            Self::AttachDocument => "attach_document",
            Self::Search => "search",
            Self::ViewStats => "view_stats",
            Self::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `role` may ever perform `action`.
#[must_use]
pub const fn allows(role: Role, action: Action) -> bool {
    use Action as A;

    match role {
        Role::Admin => match action {
            A::Create
            | A::View
            | A::EditForm
            | A::Submit
            | A::RecordPayment
            | A::ConfirmPayment
            | A::RefundPayment
            | A::AssignStaff
            | A::Review
            | A::Audit
            | A::Approve
            | A::IssueCertificate
            | A::Cancel
            | A::Transition
            | A::AttachDocument
            | A::Search
            | A::ViewStats
            | A::Reconcile => true,
        },
        Role::Applicant => match action {
            A::Create
            | A::View
            | A::EditForm
            | A::Submit
            | A::RecordPayment
            | A::Cancel
            | A::AttachDocument
            | A::Search => true,
            A::ConfirmPayment
            | A::RefundPayment
            | A::AssignStaff
            | A::Review
            | A::Audit
            | A::Approve
            | A::IssueCertificate
            | A::Transition
            | A::ViewStats
            | A::Reconcile => false,
        },
        Role::Reviewer => match action {
            A::View | A::Review | A::AttachDocument | A::Search | A::ViewStats => true,
            A::Create
            | A::EditForm
            | A::Submit
            | A::RecordPayment
            | A::ConfirmPayment
            | A::RefundPayment
            | A::AssignStaff
            | A::Audit
            | A::Approve
            | A::IssueCertificate
            | A::Cancel
            | A::Transition
            | A::Reconcile => false,
        },
        Role::Auditor => match action {
            A::View | A::Audit | A::AttachDocument | A::Search | A::ViewStats => true,
            A::Create
            | A::EditForm
            | A::Submit
            | A::RecordPayment
            | A::ConfirmPayment
            | A::RefundPayment
            | A::AssignStaff
            | A::Review
            | A::Approve
            | A::IssueCertificate
            | A::Cancel
            | A::Transition
            | A::Reconcile => false,
        },
        Role::Approver => match action {
            A::View | A::Approve | A::IssueCertificate | A::Search | A::ViewStats => true,
            A::Create
            | A::EditForm
            | A::Submit
            | A::RecordPayment
            | A::ConfirmPayment
            | A::RefundPayment
            | A::AssignStaff
            | A::Review
            | A::Audit
            | A::AttachDocument
            | A::Cancel
            | A::Transition
            | A::Reconcile => false,
        },
    }
}

/// The user performing an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id
    pub id: UserId,
    /// Capacity
    pub role: Role,
}

impl Actor {
    /// Create an actor.
    #[must_use]
    pub const fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    /// Check the capability matrix only (no per-application rules).
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Authorization`] if the role lacks the capability.
    pub fn require(&self, action: Action) -> Result<(), WorkflowError> {
        if allows(self.role, action) {
            Ok(())
        } else {
            Err(WorkflowError::Authorization {
                role: self.role,
                action,
                reason: "role lacks capability".to_string(),
            })
        }
    }
}

/// Staff members assigned to an application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffAssignments {
    /// Assigned reviewer
    pub reviewer_id: Option<UserId>,
    /// Assigned auditor
    pub auditor_id: Option<UserId>,
    /// Assigned approver
    pub approver_id: Option<UserId>,
}

/// Which staff slot an assignment fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    /// Reviewer slot
    Reviewer,
    /// Auditor slot
    Auditor,
    /// Approver slot
    Approver,
}

impl StaffRole {
    /// The actor role that may fill this slot.
    #[must_use]
    pub const fn required_role(self) -> Role {
        match self {
            Self::Reviewer => Role::Reviewer,
            Self::Auditor => Role::Auditor,
            Self::Approver => Role::Approver,
        }
    }
}

impl StaffAssignments {
    /// The assigned user for a slot.
    #[must_use]
    pub const fn get(&self, slot: StaffRole) -> Option<UserId> {
        match slot {
            StaffRole::Reviewer => self.reviewer_id,
            StaffRole::Auditor => self.auditor_id,
            StaffRole::Approver => self.approver_id,
        }
    }
}

/// Authorize `actor` to perform `action` on an application owned by `owner`.
///
/// Applicants may only touch their own applications. When a staff slot is
/// filled, only the assigned member acts in that capacity.
///
/// # Errors
///
/// Returns [`WorkflowError::Authorization`] describing the failed rule.
pub fn authorize(
    actor: &Actor,
    action: Action,
    owner: UserId,
    assignments: &StaffAssignments,
) -> Result<(), WorkflowError> {
    actor.require(action)?;

    let deny = |reason: &str| WorkflowError::Authorization {
        role: actor.role,
        action,
        reason: reason.to_string(),
    };

    match actor.role {
        Role::Admin => Ok(()),
        Role::Applicant if owner != actor.id => Err(deny("application belongs to another applicant")),
        Role::Applicant => Ok(()),
        Role::Reviewer | Role::Auditor | Role::Approver => {
            let slot = match (actor.role, action) {
                (Role::Reviewer, Action::Review) => Some(StaffRole::Reviewer),
                (Role::Auditor, Action::Audit) => Some(StaffRole::Auditor),
                (Role::Approver, Action::Approve | Action::IssueCertificate) => {
                    Some(StaffRole::Approver)
                }
                _ => None,
            };
            match slot.and_then(|slot| assignments.get(slot)) {
                Some(assigned) if assigned != actor.id => {
                    Err(deny("application is assigned to another staff member"))
                }
                _ => Ok(()),
            }
        }
    }
}
