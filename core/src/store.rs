//! Store operations and the traits the persistence adapters implement.
//!
//! Writes are expressed as typed operations ([`RelationalOp`], [`DocumentOp`])
//! so the saga coordinator can log them, route them to the right store and
//! derive a compensation for each one.
//!
//! # Implementation Notes
//!
//! - Transactions are obtained with `begin` and consumed by `commit` or
//!   `rollback`.
//! - Relational updates are conditional on `version`; a miss surfaces as
//!   [`ConflictError::ConcurrentModification`](crate::error::ConflictError).
//! - Document paths address nested JSON; numeric segments index arrays.

use crate::application::ApplicationRow;
use crate::application::RowPatch;
use crate::error::{StoreError, StoreKind, WorkflowError};
use crate::ids::{ApplicationId, ProductId, UserId};
use crate::workflow::{ApplicationStatus, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════

/// A write against the relational store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelationalOp {
    /// Insert a new application row.
    InsertApplication {
        /// Row to insert
        row: ApplicationRow,
    },
    /// Conditionally update a row and bump its version.
    UpdateApplication {
        /// Application
        id: ApplicationId,
        /// Version the writer read
        expected_version: i64,
        /// Columns to change
        patch: RowPatch,
        /// Previous values of the changed columns
        previous: RowPatch,
    },
    /// Delete a row. Only emitted as a compensation.
    DeleteApplication {
        /// Application
        id: ApplicationId,
    },
}

impl RelationalOp {
    /// Application the operation targets.
    #[must_use]
    pub const fn application_id(&self) -> ApplicationId {
        match self {
            Self::InsertApplication { row } => row.id,
            Self::UpdateApplication { id, .. } | Self::DeleteApplication { id } => *id,
        }
    }
}

/// A write against the document store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentOp {
    /// Create a document.
    Insert {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// Document body
        document: Value,
    },
    /// Overwrite the value at `path`.
    Set {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// JSON path
        path: Vec<String>,
        /// New value
        value: Value,
        /// Value before the write (`None` if absent)
        previous: Option<Value>,
    },
    /// Write `value` at `path` only if nothing is there yet.
    SetIfAbsent {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// JSON path
        path: Vec<String>,
        /// Value to write
        value: Value,
    },
    /// Append to the array at `path`.
    Push {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// JSON path of an array
        path: Vec<String>,
        /// Element to append
        value: Value,
    },
    /// Remove the last element of the array at `path`.
    PopLast {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// JSON path of an array
        path: Vec<String>,
    },
    /// Remove the value at `path`.
    Unset {
        /// Collection
        collection: String,
        /// Document id
        id: String,
        /// JSON path
        path: Vec<String>,
    },
    /// Delete a document. Only emitted as a compensation.
    Delete {
        /// Collection
        collection: String,
        /// Document id
        id: String,
    },
}

impl DocumentOp {
    /// `(collection, id)` of the target document.
    #[must_use]
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::Insert { collection, id, .. }
            | Self::Set { collection, id, .. }
            | Self::SetIfAbsent { collection, id, .. }
            | Self::Push { collection, id, .. }
            | Self::PopLast { collection, id, .. }
            | Self::Unset { collection, id, .. }
            | Self::Delete { collection, id } => (collection, id),
        }
    }

    /// JSON path addressed by the operation (empty for whole-document ops).
    #[must_use]
    pub fn path(&self) -> &[String] {
        match self {
            Self::Set { path, .. }
            | Self::SetIfAbsent { path, .. }
            | Self::Push { path, .. }
            | Self::PopLast { path, .. }
            | Self::Unset { path, .. } => path,
            Self::Insert { .. } | Self::Delete { .. } => &[],
        }
    }

    const fn verb(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Set { .. } => "set",
            Self::SetIfAbsent { .. } => "set_if_absent",
            Self::Push { .. } => "push",
            Self::PopLast { .. } => "pop_last",
            Self::Unset { .. } => "unset",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Build a JSON path from string segments.
#[must_use]
pub fn path<const N: usize>(segments: [&str; N]) -> Vec<String> {
    segments.iter().map(ToString::to_string).collect()
}

/// A store-tagged saga step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "store", content = "operation", rename_all = "snake_case")]
pub enum StoreOp {
    /// Routed to the relational transaction
    Relational(RelationalOp),
    /// Routed to the document transaction
    Document(DocumentOp),
}

impl StoreOp {
    /// Store the operation is routed to.
    #[must_use]
    pub const fn store(&self) -> StoreKind {
        match self {
            Self::Relational(_) => StoreKind::Relational,
            Self::Document(_) => StoreKind::Document,
        }
    }

    /// One-line description used in logs and errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Relational(RelationalOp::InsertApplication { row }) => {
                format!("relational insert application {}", row.id)
            }
            Self::Relational(RelationalOp::UpdateApplication {
                id,
                expected_version,
                patch,
                ..
            }) => format!(
                "relational update application {id} at version {expected_version} [{}]",
                patch.fields().join(", ")
            ),
            Self::Relational(RelationalOp::DeleteApplication { id }) => {
                format!("relational delete application {id}")
            }
            Self::Document(op) => {
                let (collection, id) = op.target();
                let path = op.path().join(".");
                if path.is_empty() {
                    format!("document {} {collection}/{id}", op.verb())
                } else {
                    format!("document {} {collection}/{id} {path}", op.verb())
                }
            }
        }
    }

    /// The operation that undoes this one, if any.
    ///
    /// `SetIfAbsent` is only planned for paths known to be absent, so its
    /// inverse is `Unset`.
    #[must_use]
    pub fn compensation(&self) -> Option<Self> {
        match self {
            Self::Relational(op) => match op {
                RelationalOp::InsertApplication { row } => {
                    Some(Self::Relational(RelationalOp::DeleteApplication { id: row.id }))
                }
                RelationalOp::UpdateApplication {
                    id,
                    expected_version,
                    patch,
                    previous,
                } => Some(Self::Relational(RelationalOp::UpdateApplication {
                    id: *id,
                    expected_version: expected_version + 1,
                    patch: previous.clone(),
                    previous: patch.clone(),
                })),
                RelationalOp::DeleteApplication { .. } => None,
            },
            Self::Document(op) => {
                let inverse = match op {
                    DocumentOp::Insert { collection, id, .. } => DocumentOp::Delete {
                        collection: collection.clone(),
                        id: id.clone(),
                    },
                    DocumentOp::Set {
                        collection,
                        id,
                        path,
                        value,
                        previous,
                    } => match previous {
                        Some(previous) => DocumentOp::Set {
                            collection: collection.clone(),
                            id: id.clone(),
                            path: path.clone(),
                            value: previous.clone(),
                            previous: Some(value.clone()),
                        },
                        None => DocumentOp::Unset {
                            collection: collection.clone(),
                            id: id.clone(),
                            path: path.clone(),
                        },
                    },
                    DocumentOp::SetIfAbsent {
                        collection,
                        id,
                        path,
                        ..
                    } => DocumentOp::Unset {
                        collection: collection.clone(),
                        id: id.clone(),
                        path: path.clone(),
                    },
                    DocumentOp::Push {
                        collection,
                        id,
                        path,
                        ..
                    } => DocumentOp::PopLast {
                        collection: collection.clone(),
                        id: id.clone(),
                        path: path.clone(),
                    },
                    DocumentOp::PopLast { .. } | DocumentOp::Unset { .. } | DocumentOp::Delete { .. } => {
                        return None;
                    }
                };
                Some(Self::Document(inverse))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════

/// Filters for application search.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    /// Exact status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
    /// Exact stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Owning applicant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Product
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<ProductId>,
    /// Assigned to this staff member in any slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    /// Created at or after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,
    /// Created before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
    /// Free text matched against form content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Restrict to these ids (filled from the free-text match)
    #[serde(skip)]
    pub ids: Option<Vec<ApplicationId>>,
}

/// Filters for aggregate statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFilter {
    /// Owning applicant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Product
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<ProductId>,
    /// Created at or after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,
    /// Created before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
}

/// Maximum page size.
pub const MAX_PER_PAGE: u32 = 100;

/// Page request (1-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Page number, starting at 1
    pub page: u32,
    /// Rows per page
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Pagination {
    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Validation`] for page 0 or a page size outside
    /// `1..=MAX_PER_PAGE`.
    pub fn validate(self) -> Result<Self, WorkflowError> {
        if self.page == 0 {
            return Err(WorkflowError::Validation("page must be at least 1".into()));
        }
        if self.per_page == 0 || self.per_page > MAX_PER_PAGE {
            return Err(WorkflowError::Validation(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}"
            )));
        }
        Ok(self)
    }

    /// Rows to skip.
    #[must_use]
    pub const fn offset(self) -> u64 {
        (self.page as u64 - 1) * self.per_page as u64
    }

    /// Metadata for a result set of `total` rows.
    #[must_use]
    pub const fn meta(self, total: u64) -> PaginationMeta {
        let per_page = self.per_page as u64;
        PaginationMeta {
            page: self.page,
            per_page: self.per_page,
            total,
            total_pages: total.div_ceil(per_page),
        }
    }
}

/// Pagination metadata returned with search results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    /// Current page
    pub page: u32,
    /// Rows per page
    pub per_page: u32,
    /// Total matching rows
    pub total: u64,
    /// Number of pages
    pub total_pages: u64,
}

/// One page of relational rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowPage {
    /// Rows on this page
    pub rows: Vec<ApplicationRow>,
    /// Total matching rows
    pub total: u64,
}

/// Search response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    /// Matching rows
    pub rows: Vec<ApplicationRow>,
    /// Pagination metadata
    pub pagination: PaginationMeta,
    /// Documents matching the free-text query, if one was given
    pub free_text_match_count: Option<u64>,
}

/// Aggregate counts over applications.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStats {
    /// Number of applications
    pub total: u64,
    /// Count per status
    pub by_status: BTreeMap<String, u64>,
    /// Count per stage
    pub by_stage: BTreeMap<String, u64>,
    /// Sum of `total_payments`
    pub total_payments: i64,
    /// Mean completeness score
    pub average_completeness: f64,
}

// ═══════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════

/// An open relational transaction.
pub trait RelationalTransaction: Send {
    /// Apply one operation inside the transaction.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::Store`] on backend failure
    /// - [`WorkflowError::Conflict`] when a conditional update misses
    fn apply(&mut self, op: &RelationalOp) -> impl Future<Output = Result<(), WorkflowError>> + Send;

    /// Commit.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the commit fails.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll back.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the rollback fails.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Authoritative relational store.
pub trait RelationalStore: Send + Sync {
    /// Transaction type.
    type Tx: RelationalTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if no connection could be acquired in time.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    /// Read one row.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn fetch_application(
        &self,
        id: ApplicationId,
    ) -> impl Future<Output = Result<Option<ApplicationRow>, StoreError>> + Send;

    /// Filtered, paginated rows ordered by creation time (newest first).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn search(
        &self,
        filter: &SearchFilter,
        page: Pagination,
    ) -> impl Future<Output = Result<RowPage, StoreError>> + Send;

    /// Aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn stats(
        &self,
        filter: &StatsFilter,
    ) -> impl Future<Output = Result<ApplicationStats, StoreError>> + Send;
}

/// An open document transaction.
pub trait DocumentTransaction: Send {
    /// Apply one operation inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Store`] on backend failure or a missing document.
    fn apply(&mut self, op: &DocumentOp) -> impl Future<Output = Result<(), WorkflowError>> + Send;

    /// Commit.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the commit fails.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll back.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the rollback fails.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Variable-schema document store.
pub trait DocumentStore: Send + Sync {
    /// Transaction type.
    type Tx: DocumentTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if no connection could be acquired in time.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    /// Read a document.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Ids of documents whose content contains `text` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn search_text(
        &self,
        collection: &str,
        text: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// Key-value cache backend.
///
/// Errors are reported; the runtime cache layer decides to fail open.
pub trait Cache: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Write a value with a TTL.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete one key.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every key starting with `prefix`; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on backend failure.
    fn delete_prefix(&self, prefix: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
