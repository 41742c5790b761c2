//! Prometheus metrics for tool execution.
//!
//! Metrics are recorded through the `metrics` facade everywhere in the crate:
//! - Tool invocations and attempts
//! - Retry outcomes
//! - Circuit breaker state
//! - Admission (concurrency slots and queueing)
//!
//! Nothing is exported until a recorder is installed, e.g. with
//! [`PrometheusExporter::install`]. Serving the scrape text is left to the
//! host application.
//!
//! # Example
//!
//! ```rust,no_run
//! use toolguard_runtime::metrics::PrometheusExporter;
//!
//! # fn example() -> Result<(), toolguard_runtime::metrics::ExporterError> {
//! if let Some(exporter) = PrometheusExporter::install()? {
//!     println!("{}", exporter.render());
//! }
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;
use toolguard_core::tool::ToolCategory;

pub use metrics::{counter, gauge, histogram};

/// Histogram buckets in seconds, spanning fast local calls to the longest
/// retried invocations.
const DURATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

const DURATION_HISTOGRAMS: [&str; 2] = ["tool_invocation_duration_seconds", "tool_attempt_duration_seconds"];

/// Errors from [`PrometheusExporter::install`].
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Histogram buckets were rejected
    #[error("Invalid histogram buckets: {0}")]
    Buckets(#[source] BuildError),
    /// The recorder could not be installed
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[source] BuildError),
}

/// Prometheus recorder for the tool execution metrics.
#[derive(Clone)]
pub struct PrometheusExporter {
    handle: PrometheusHandle,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Builder with the tool duration histograms bucketed.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::Buckets`] if the buckets are rejected.
    pub fn builder() -> Result<PrometheusBuilder, ExporterError> {
        DURATION_HISTOGRAMS.iter().try_fold(PrometheusBuilder::new(), |builder, name| {
            builder
                .set_buckets_for_metric(Matcher::Full((*name).to_string()), DURATION_BUCKETS)
                .map_err(ExporterError::Buckets)
        })
    }

    /// Describe every metric and install the process-global recorder.
    ///
    /// Returns `None` if a recorder is already installed; metrics keep
    /// flowing to that one.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError`] if the recorder cannot be built or installed.
    pub fn install() -> Result<Option<Self>, ExporterError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                register_metrics();
                tracing::info!("Prometheus recorder installed");
                Ok(Some(Self { handle }))
            }
            Err(BuildError::FailedToSetGlobalRecorder(_)) => {
                tracing::warn!("A metrics recorder is already installed");
                Ok(None)
            }
            Err(err) => Err(ExporterError::Install(err)),
        }
    }

    /// Handle for rendering from elsewhere.
    #[must_use]
    pub const fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Tool Metrics
    describe_counter!(
        "tool_invocations_total",
        "Total number of tool invocations through the execution manager"
    );
    describe_counter!(
        "tool_invocation_errors_total",
        "Total number of tool invocations that ended in an error"
    );
    describe_histogram!(
        "tool_invocation_duration_seconds",
        "Time from admission request to result, retries included"
    );
    describe_counter!(
        "tool_attempts_total",
        "Total number of individual tool calls, one per attempt"
    );
    describe_counter!(
        "tool_attempt_failures_total",
        "Total number of failed attempts"
    );
    describe_histogram!(
        "tool_attempt_duration_seconds",
        "Time taken by a single attempt"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retries scheduled");
    describe_counter!(
        "retry_successes_total",
        "Total number of executions that succeeded after at least one retry"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of executions that ran out of attempts"
    );

    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_state_changes_total",
        "Total number of circuit breaker state transitions"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Admission Metrics
    describe_gauge!(
        "tool_executions_in_flight",
        "Tool executions currently holding an admission slot"
    );
    describe_gauge!(
        "tool_admission_waiting",
        "Tool executions waiting for an admission slot"
    );
    describe_counter!(
        "tool_admission_rejections_total",
        "Total number of executions rejected before admission"
    );
}

/// Tool invocation metrics recorder.
pub struct ToolMetrics;

impl ToolMetrics {
    /// Record a finished invocation.
    pub fn record_invocation(tool: &str, category: &ToolCategory, duration: Duration) {
        counter!(
            "tool_invocations_total",
            "tool" => tool.to_string(),
            "category" => category.to_string()
        )
        .increment(1);
        histogram!("tool_invocation_duration_seconds", "category" => category.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record an invocation that ended in an error.
    pub fn record_error(tool: &str, error_code: &str) {
        counter!(
            "tool_invocation_errors_total",
            "tool" => tool.to_string(),
            "code" => error_code.to_string()
        )
        .increment(1);
    }

    /// Record one attempt.
    pub fn record_attempt(category: &ToolCategory, duration: Duration, succeeded: bool) {
        counter!("tool_attempts_total", "category" => category.to_string()).increment(1);
        if !succeeded {
            counter!("tool_attempt_failures_total", "category" => category.to_string()).increment(1);
        }
        histogram!("tool_attempt_duration_seconds", "category" => category.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a scheduled retry.
    pub fn record_attempt(category: &ToolCategory) {
        counter!("retry_attempts_total", "category" => category.to_string()).increment(1);
    }

    /// Record a success after at least one retry.
    pub fn record_success(category: &ToolCategory) {
        counter!("retry_successes_total", "category" => category.to_string()).increment(1);
    }

    /// Record exhausted attempts.
    pub fn record_exhausted(category: &ToolCategory) {
        counter!("retry_exhausted_total", "category" => category.to_string()).increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record a state transition and the new state.
    pub fn record_transition(breaker: &str, from: State, to: State) {
        counter!(
            "circuit_breaker_state_changes_total",
            "breaker" => breaker.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        gauge!("circuit_breaker_state", "breaker" => breaker.to_string()).set(to.gauge_value());
    }

    /// Record a successful call.
    pub fn record_success(breaker: &str) {
        counter!("circuit_breaker_successes_total", "breaker" => breaker.to_string()).increment(1);
    }

    /// Record a failed call.
    pub fn record_failure(breaker: &str) {
        counter!("circuit_breaker_failures_total", "breaker" => breaker.to_string()).increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(breaker: &str) {
        counter!("circuit_breaker_rejections_total", "breaker" => breaker.to_string()).increment(1);
    }
}

/// Admission metrics recorder.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Set the number of executions holding a slot.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_in_flight(count: usize) {
        gauge!("tool_executions_in_flight").set(count as f64);
    }

    /// Set the number of executions waiting for a slot.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_waiting(count: usize) {
        gauge!("tool_admission_waiting").set(count as f64);
    }

    /// Record an execution rejected before admission.
    pub fn record_rejection(reason: &'static str) {
        counter!("tool_admission_rejections_total", "reason" => reason).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_histograms_use_tool_buckets() {
        let recorder = PrometheusExporter::builder().expect("valid buckets").build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            ToolMetrics::record_invocation("lookup", &ToolCategory::RestApi, Duration::from_secs(45));
            ToolMetrics::record_attempt(&ToolCategory::RestApi, Duration::from_millis(100), false);
            BreakerMetrics::record_transition("rest_api:lookup", State::Closed, State::Open);
            AdmissionMetrics::record_rejection("queue_full");
        });

        let rendered = handle.render();
        assert!(rendered.contains("tool_invocations_total"));
        assert!(rendered.contains("tool_attempt_failures_total"));
        assert!(rendered.contains("circuit_breaker_state_changes_total"));
        assert!(rendered.contains("tool_admission_rejections_total"));
        assert!(rendered.contains("tool_invocation_duration_seconds_bucket"));
        assert!(rendered.contains("le=\"120\""));
    }

    #[test]
    fn test_install_tolerates_existing_recorder() {
        let first = PrometheusExporter::install().expect("installs");
        let second = PrometheusExporter::install().expect("tolerated");
        assert!(second.is_none());
        if let Some(exporter) = first {
            ToolMetrics::record_error("lookup", "TOOL_TIMEOUT");
            assert!(exporter.render().contains("tool_invocation_errors_total"));
        }
    }
}
