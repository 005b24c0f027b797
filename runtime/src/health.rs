//! Health reporting for the backends the service depends on.
//!
//! Databases and the saga log are required: a failed probe is `unhealthy`.
//! The cache is optional: a failed or disabled cache is `degraded`, as is a
//! saga log holding unreconciled partial commits.

use certflow_core::error::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Health levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Serving, with reduced guarantees or pending operator work
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Whether the service can run (healthy or degraded).
    #[must_use]
    pub const fn is_serving(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Relational database
    Relational,
    /// Document database
    Documents,
    /// Redis cache
    Cache,
    /// Durable saga log
    SagaLog,
}

/// Result of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Probed backend
    pub component: Component,
    /// Outcome
    pub status: HealthStatus,
    /// Why the backend is not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Probe round trip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Partial commits awaiting reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_commits: Option<usize>,
}

impl HealthCheck {
    const fn new(component: Component, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component,
            status,
            message,
            latency_ms: None,
            partial_commits: None,
        }
    }

    fn timed(mut self, elapsed: Duration) -> Self {
        self.latency_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// A database probe: any error makes the backend unhealthy.
    #[must_use]
    pub fn database(component: Component, probe: Result<(), StoreError>, elapsed: Duration) -> Self {
        match probe {
            Ok(()) => Self::new(component, HealthStatus::Healthy, None),
            Err(e) => Self::new(component, HealthStatus::Unhealthy, Some(e.to_string())),
        }
        .timed(elapsed)
    }

    /// The cache probe. `None` means the service runs without a cache.
    #[must_use]
    pub fn cache(probe: Option<Result<(), StoreError>>, elapsed: Duration) -> Self {
        match probe {
            None => Self::new(
                Component::Cache,
                HealthStatus::Degraded,
                Some("cache disabled, reads go to the stores".into()),
            ),
            Some(Ok(())) => Self::new(Component::Cache, HealthStatus::Healthy, None).timed(elapsed),
            Some(Err(e)) => {
                Self::new(Component::Cache, HealthStatus::Degraded, Some(e.to_string())).timed(elapsed)
            }
        }
    }

    /// The saga log, from the number of unreconciled partial commits.
    #[must_use]
    pub fn saga_log(unresolved: Result<usize, StoreError>) -> Self {
        match unresolved {
            Ok(0) => Self {
                partial_commits: Some(0),
                ..Self::new(Component::SagaLog, HealthStatus::Healthy, None)
            },
            Ok(n) => Self {
                partial_commits: Some(n),
                ..Self::new(
                    Component::SagaLog,
                    HealthStatus::Degraded,
                    Some(format!("{n} partial commits awaiting reconciliation")),
                )
            },
            Err(e) => Self::new(Component::SagaLog, HealthStatus::Unhealthy, Some(e.to_string())),
        }
    }
}

/// Every probe plus the overall verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual probes
    pub checks: Vec<HealthCheck>,
    /// When the probes ran
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Aggregate `checks` taken at `checked_at`.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, checked_at: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            checked_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certflow_core::error::StoreKind;

    #[test]
    fn overall_status_is_the_worst_check() {
        let now = Utc::now();
        assert_eq!(HealthReport::new(Vec::new(), now).status, HealthStatus::Healthy);

        let report = HealthReport::new(
            vec![
                HealthCheck::database(Component::Relational, Ok(()), Duration::from_millis(2)),
                HealthCheck::cache(
                    Some(Err(StoreError::new(StoreKind::Cache, "connection refused"))),
                    Duration::ZERO,
                ),
            ],
            now,
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.status.is_serving());
    }

    #[test]
    fn failed_database_probe_is_unhealthy() {
        let check = HealthCheck::database(
            Component::Documents,
            Err(StoreError::new(StoreKind::Document, "timeout")),
            Duration::from_secs(5),
        );
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.latency_ms, Some(5_000));
        assert!(!HealthReport::new(vec![check], Utc::now()).status.is_serving());
    }

    #[test]
    fn missing_cache_degrades() {
        let check = HealthCheck::cache(None, Duration::ZERO);
        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.latency_ms, None);
    }

    #[test]
    fn pending_partial_commits_degrade_the_saga_log() {
        let check = HealthCheck::saga_log(Ok(3));
        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.partial_commits, Some(3));
        assert_eq!(
            check.message.as_deref(),
            Some("3 partial commits awaiting reconciliation")
        );
        assert_eq!(HealthCheck::saga_log(Ok(0)).status, HealthStatus::Healthy);
    }
}
