//! # certflow testing
//!
//! Testing utilities for the certification workflow.
//!
//! This crate provides:
//! - In-memory relational, document and cache stores plus a saga log, all
//!   wired to a shared [`Faults`] switchboard for failure injection
//! - Recording doubles for the notifier and certificate issuer
//! - A controllable clock and form fixtures
//!
//! ## Example
//!
//! ```ignore
//! use certflow_testing::{Faults, InMemoryRelationalStore, InMemoryDocumentStore};
//!
//! let faults = Faults::new();
//! let relational = InMemoryRelationalStore::with_faults(faults.clone());
//! let documents = InMemoryDocumentStore::with_faults(faults.clone());
//!
//! // Fail the third operation of the next saga
//! faults.fail_step(2);
//! ```

pub mod cache;
pub mod collaborators;
pub mod document;
pub mod faults;
pub mod json_path;
pub mod relational;
pub mod saga_log;

use chrono::{DateTime, Utc};
use certflow_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Clock for deterministic tests
    ///
    /// Returns the same time until moved with [`FixedClock::advance`] or
    /// [`FixedClock::set`]. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use certflow_testing::mocks::FixedClock;
    /// use certflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut time) = self.time.write() {
                *time += by;
            }
        }

        /// Jump to a specific time.
        pub fn set(&self, to: DateTime<Utc>) {
            if let Ok(mut time) = self.time.write() {
                *time = to;
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time.read().map_or_else(|poisoned| *poisoned.into_inner(), |time| *time)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Form and row fixtures.
pub mod fixtures {
    use certflow_core::application::{ApplicationRow, generate_code};
    use certflow_core::capability::StaffAssignments;
    use certflow_core::ids::{ApplicationId, ProductId, UserId};
    use certflow_core::workflow::{ApplicationStatus, Stage};
    use chrono::{DateTime, Utc};
    use serde_json::{Map, Value, json};

    /// A version-1 draft row owned by `user_id`, whose document id is its own id.
    #[must_use]
    pub fn draft_row(user_id: UserId, now: DateTime<Utc>) -> ApplicationRow {
        let id = ApplicationId::new();
        ApplicationRow {
            id,
            code: generate_code(now),
            user_id,
            product_id: ProductId::new(),
            status: ApplicationStatus::Draft,
            stage: Stage::Application,
            completeness_score: 0,
            rejection_count: 0,
            total_payments: 0,
            assignments: StaffAssignments::default(),
            certificate_number: None,
            document_id: id.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// A form that fills every field of the default completeness policy.
    #[must_use]
    pub fn complete_form() -> Map<String, Value> {
        let form = json!({
            "farmName": "Green Valley Farm",
            "ownerName": "A. Producer",
            "farmAddress": "12 River Road",
            "contactPhone": "+66 2 000 0000",
            "contactEmail": "farm@example.com",
            "farmArea": 12.5,
            "cropTypes": ["rice", "mango"],
            "cultivationMethod": "organic",
            "waterSource": "river",
            "landTitle": "NS4-1234"
        });
        form.as_object().cloned().unwrap_or_default()
    }

    /// A form scoring 40 under the default policy.
    #[must_use]
    pub fn partial_form() -> Map<String, Value> {
        let form = json!({
            "farmName": "Green Valley Farm",
            "ownerName": "A. Producer",
            "cropTypes": ["rice"]
        });
        form.as_object().cloned().unwrap_or_default()
    }
}

/// Install a `tracing` subscriber writing to the test output. Safe to call
/// from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use cache::InMemoryCache;
pub use collaborators::{MockCertificateIssuer, RecordingNotifier};
pub use document::InMemoryDocumentStore;
pub use faults::Faults;
pub use mocks::{FixedClock, test_clock};
pub use relational::InMemoryRelationalStore;
pub use saga_log::InMemorySagaLog;

#[cfg(test)]
mod tests {
    use super::*;
    use certflow_core::completeness::CompletenessPolicy;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");

        clock.advance(chrono::Duration::days(2));
        assert_eq!(clock.now() - time1, chrono::Duration::days(2));
    }

    #[test]
    fn fixtures_score_as_documented() {
        let policy = CompletenessPolicy::default();
        assert_eq!(policy.evaluate(&fixtures::complete_form()).score, 100);
        assert_eq!(policy.evaluate(&fixtures::partial_form()).score, 40);
    }
}
