//! Prometheus metrics for the coordinator, the cache layer and the workflow.
//!
//! # Example
//!
//! ```rust,no_run
//! use certflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder with a render handle.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A second installation in the same process (tests) is logged and
    /// treated as success.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Saga coordinator
    describe_counter!("certflow_saga_started_total", "Sagas recorded in the saga log");
    describe_counter!("certflow_saga_completed_total", "Sagas committed in both stores");
    describe_counter!(
        "certflow_saga_rolled_back_total",
        "Sagas rolled back in both stores"
    );
    describe_counter!(
        "certflow_saga_partial_commits_total",
        "Sagas committed in the relational store only"
    );
    describe_counter!(
        "certflow_saga_compensated_total",
        "Partially committed sagas reconciled by compensation"
    );
    describe_histogram!(
        "certflow_saga_duration_seconds",
        "Time from saga start to its final phase"
    );
    describe_counter!(
        "certflow_saga_log_partial_commits_total",
        "Partial commits written to the durable saga log"
    );
    describe_counter!(
        "certflow_saga_log_resolved_total",
        "Sagas closed manually"
    );

    // Cache
    describe_counter!("certflow_cache_hits_total", "Cache reads that found a value");
    describe_counter!("certflow_cache_misses_total", "Cache reads that found nothing");
    describe_counter!(
        "certflow_cache_errors_total",
        "Cache calls that failed or timed out (served as a miss)"
    );

    // Workflow
    describe_counter!(
        "certflow_transitions_total",
        "Committed workflow transitions by source and target status"
    );

    // Stores
    describe_counter!(
        "certflow_store_slow_operations_total",
        "Store operations slower than the configured threshold"
    );
    describe_histogram!(
        "certflow_store_operation_duration_seconds",
        "Store operation latency"
    );
}

/// Saga coordinator metrics recorder.
pub struct SagaMetrics;

impl SagaMetrics {
    /// Record a saga start.
    pub fn record_started() {
        counter!("certflow_saga_started_total").increment(1);
    }

    /// Record a fully committed saga.
    pub fn record_completed(duration: Duration) {
        counter!("certflow_saga_completed_total").increment(1);
        histogram!("certflow_saga_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rolled back saga.
    pub fn record_rolled_back(duration: Duration) {
        counter!("certflow_saga_rolled_back_total").increment(1);
        histogram!("certflow_saga_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a partial commit.
    pub fn record_partial_commit() {
        counter!("certflow_saga_partial_commits_total").increment(1);
    }

    /// Record a reconciled saga.
    pub fn record_compensated() {
        counter!("certflow_saga_compensated_total").increment(1);
    }
}

/// Cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a hit.
    pub fn record_hit() {
        counter!("certflow_cache_hits_total").increment(1);
    }

    /// Record a miss.
    pub fn record_miss() {
        counter!("certflow_cache_misses_total").increment(1);
    }

    /// Record a failed or timed out call.
    pub fn record_error(operation: &'static str) {
        counter!("certflow_cache_errors_total", "operation" => operation).increment(1);
    }
}

/// Workflow metrics recorder.
pub struct WorkflowMetrics;

impl WorkflowMetrics {
    /// Record a committed transition.
    pub fn record_transition(from: &'static str, to: &'static str) {
        counter!("certflow_transitions_total", "from" => from, "to" => to).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        SagaMetrics::record_started();
        SagaMetrics::record_completed(Duration::from_millis(20));
        WorkflowMetrics::record_transition("draft", "submitted");

        // Another test may have installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("certflow_saga_started_total"));
            assert!(rendered.contains("certflow_transitions_total"));
        }
    }
}
