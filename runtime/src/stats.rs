//! In-process execution statistics.
//!
//! Counters kept by a [`ToolExecutionManager`](crate::manager::ToolExecutionManager)
//! for its debug surface, next to the Prometheus metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free execution counters.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    total_invocations: AtomicU64,
    total_tool_executions: AtomicU64,
    invocation_nanos: AtomicU64,
    tool_execution_nanos: AtomicU64,
    error_count: AtomicU64,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl ExecutionStats {
    /// Fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished invocation, retries included.
    pub fn record_invocation(&self, duration: Duration, failed: bool) {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        self.invocation_nanos.fetch_add(nanos(duration), Ordering::Relaxed);
        if failed {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a single call of a tool (one attempt).
    pub fn record_tool_execution(&self, duration: Duration) {
        self.total_tool_executions.fetch_add(1, Ordering::Relaxed);
        self.tool_execution_nanos.fetch_add(nanos(duration), Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total_invocations.store(0, Ordering::Relaxed);
        self.total_tool_executions.store(0, Ordering::Relaxed);
        self.invocation_nanos.store(0, Ordering::Relaxed);
        self.tool_execution_nanos.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Current values with derived averages.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ExecutionMetrics {
        let total_invocations = self.total_invocations.load(Ordering::Relaxed);
        let total_tool_executions = self.total_tool_executions.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);

        let average = |total_nanos: u64, count: u64| {
            total_nanos.checked_div(count).map_or(Duration::ZERO, Duration::from_nanos)
        };

        ExecutionMetrics {
            total_invocations,
            total_tool_executions,
            avg_invocation_time: average(self.invocation_nanos.load(Ordering::Relaxed), total_invocations),
            avg_tool_execution_time: average(
                self.tool_execution_nanos.load(Ordering::Relaxed),
                total_tool_executions,
            ),
            error_count,
            error_rate: if total_invocations == 0 {
                0.0
            } else {
                error_count as f64 / total_invocations as f64
            },
        }
    }
}

/// Snapshot of [`ExecutionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    /// Invocations through the manager
    pub total_invocations: u64,
    /// Individual tool calls, one per attempt
    pub total_tool_executions: u64,
    /// Mean invocation time, retries included
    pub avg_invocation_time: Duration,
    /// Mean time of a single tool call
    pub avg_tool_execution_time: Duration,
    /// Invocations that ended in an error
    pub error_count: u64,
    /// `error_count / total_invocations` (0.0 to 1.0)
    pub error_rate: f64,
}
