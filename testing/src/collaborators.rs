//! Recording doubles for the external collaborators.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use certflow_core::application::Application;
use certflow_core::collaborators::{
    CertificateIssuer, CertificateOptions, CollaboratorError, Notification, Notifier,
};
use certflow_core::records::CertificateRecord;
use chrono::{Datelike, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Notifier that keeps every notification it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications received so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `count` notifications arrived (they are dispatched
    /// on spawned tasks). Gives up after about a second.
    pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
        for _ in 0..100 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(notification);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError {
                    service: "notifier",
                    message: "injected delivery failure".to_string(),
                });
            }
            Ok(())
        })
    }
}

/// Certificate issuer producing deterministic certificate numbers.
#[derive(Clone, Debug, Default)]
pub struct MockCertificateIssuer {
    issued: Arc<Mutex<Vec<Application>>>,
    failing: Arc<AtomicBool>,
}

impl MockCertificateIssuer {
    /// Issuer that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make issuing fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshots the issuer was called with.
    #[must_use]
    pub fn issued(&self) -> Vec<Application> {
        self.issued.lock().unwrap().clone()
    }
}

impl CertificateIssuer for MockCertificateIssuer {
    fn issue(
        &self,
        application: Application,
        options: CertificateOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CertificateRecord, CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError {
                    service: "certificate",
                    message: "injected rendering failure".to_string(),
                });
            }
            let issue_date = Utc::now();
            let years = i32::try_from(options.validity_years).unwrap_or(i32::MAX);
            let expiry_date = issue_date
                .with_year(issue_date.year().saturating_add(years))
                .unwrap_or(issue_date);
            let record = CertificateRecord {
                certificate_number: format!("CN-{}", application.code),
                file_path: format!("certificates/{}.pdf", application.id),
                issue_date,
                expiry_date,
            };
            self.issued.lock().unwrap().push(application);
            Ok(record)
        })
    }
}
