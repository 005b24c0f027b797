//! External collaborators consumed by the workflow.
//!
//! Both traits are dyn-compatible; the service holds them as `Arc<dyn ..>`.

use crate::application::Application;
use crate::capability::Actor;
use crate::records::CertificateRecord;
use crate::workflow::ApplicationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure reported by an external service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{service} failed: {message}")]
pub struct CollaboratorError {
    /// Service name
    pub service: &'static str,
    /// Failure message
    pub message: String,
}

/// Options passed to the certificate service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateOptions {
    /// Validity in years from the issue date
    pub validity_years: u32,
    /// Certificate template name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Language of the rendered certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Default for CertificateOptions {
    fn default() -> Self {
        Self {
            validity_years: 3,
            template: None,
            language: None,
        }
    }
}

/// Renders and stores certificates.
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate for an approved application.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the certificate could not be produced.
    fn issue(
        &self,
        application: Application,
        options: CertificateOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CertificateRecord, CollaboratorError>> + Send + '_>>;
}

/// A workflow event to tell people about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Application after the change
    pub application: Application,
    /// State the application moved to
    pub target_state: ApplicationStatus,
    /// Who caused it
    pub actor: Actor,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Dispatches notifications. Called fire-and-forget.
pub trait Notifier: Send + Sync {
    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on delivery failure; callers only log it.
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;
}
