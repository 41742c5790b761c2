//! Execution strategies: how one category of tools is run.
//!
//! A strategy binds a tool call to a policy: the call timeout resolved from
//! the configuration, the category's retry policy, and (when enabled) a
//! circuit breaker, whose call timeout bounds the whole retried run.
//! [`PolicyStrategy`] is the built-in implementation; its
//! variants differ in category, remediation hints, and whether the tool's
//! connection phase runs first under the connection timeout.

use crate::circuit_breaker::{BreakerSet, BreakerSnapshot};
use crate::metrics::{RetryMetrics, ToolMetrics};
use crate::retry::RetryExecutor;
use crate::stats::ExecutionStats;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{error::Elapsed, Instant};
use toolguard_core::config::{BreakerScope, RunConfiguration};
use toolguard_core::context::ExecutionContext;
use toolguard_core::error::{FailureKind, OriginalError, ToolExecutionError};
use toolguard_core::tool::{Tool, ToolCategory};

/// Why a single attempt failed.
#[derive(Debug)]
pub enum AttemptError {
    /// The connection phase exceeded the connection timeout
    ConnectTimeout {
        /// Timeout that applied
        after: Duration,
        /// Timer error
        source: Elapsed,
    },
    /// The call exceeded the call timeout
    Timeout {
        /// Timeout that applied
        after: Duration,
        /// Timer error
        source: Elapsed,
    },
    /// The tool reported an error while connecting or calling
    Failed(anyhow::Error),
}

impl AttemptError {
    const fn kind(&self) -> FailureKind {
        match self {
            Self::ConnectTimeout { .. } => FailureKind::ConnectionTimeout,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Failed(_) => FailureKind::Failed,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout { after, .. } => {
                write!(f, "connection timed out after {:.1}s", after.as_secs_f64())
            }
            Self::Timeout { after, .. } => write!(f, "timed out after {:.1}s", after.as_secs_f64()),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// A failed attempt, as seen by [`AttemptFailedHook`]s.
#[derive(Debug)]
pub struct AttemptFailure<'a> {
    /// Tool name
    pub tool: &'a str,
    /// Category the tool ran under
    pub category: &'a ToolCategory,
    /// 1-based attempt number
    pub attempt: u32,
    /// Attempts the policy allows
    pub max_attempts: u32,
    /// Why it failed
    pub error: &'a AttemptError,
    /// Duration of this attempt
    pub elapsed: Duration,
    /// Context of the execution
    pub context: &'a ExecutionContext,
}

/// Telemetry callback fired after every failed attempt, the last one included.
pub type AttemptFailedHook = Arc<dyn Fn(&AttemptFailure<'_>) + Send + Sync>;

/// Telemetry sinks passed to a strategy with each request.
#[derive(Clone, Default)]
pub struct ExecutionObserver {
    hooks: Vec<AttemptFailedHook>,
    stats: Option<Arc<ExecutionStats>>,
    trace_attempts: bool,
}

impl ExecutionObserver {
    /// Observer that reports attempt failures to `hooks` and attempt timings
    /// to `stats`.
    #[must_use]
    pub fn new(hooks: Vec<AttemptFailedHook>, stats: Option<Arc<ExecutionStats>>) -> Self {
        Self {
            hooks,
            stats,
            trace_attempts: false,
        }
    }

    /// Log every attempt at info level instead of debug.
    #[must_use]
    pub const fn with_attempt_tracing(mut self, enabled: bool) -> Self {
        self.trace_attempts = enabled;
        self
    }

    fn attempt_finished(&self, tool: &str, category: &ToolCategory, attempt: u32, elapsed: Duration, ok: bool) {
        if let Some(stats) = &self.stats {
            stats.record_tool_execution(elapsed);
        }
        ToolMetrics::record_attempt(category, elapsed, ok);
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if self.trace_attempts {
            tracing::info!(tool, category = %category, attempt, elapsed_ms, ok, "Tool attempt finished");
        } else {
            tracing::debug!(tool, category = %category, attempt, elapsed_ms, ok, "Tool attempt finished");
        }
    }

    fn attempt_failed(&self, failure: &AttemptFailure<'_>) {
        for hook in &self.hooks {
            hook(failure);
        }
    }
}

impl fmt::Debug for ExecutionObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionObserver")
            .field("hooks", &self.hooks.len())
            .field("stats", &self.stats.is_some())
            .field("trace_attempts", &self.trace_attempts)
            .finish()
    }
}

/// Everything a strategy needs to run one tool call.
pub struct ExecutionRequest {
    /// Tool to call
    pub tool: Arc<dyn Tool>,
    /// JSON arguments
    pub args: Value,
    /// Where the call happens
    pub context: ExecutionContext,
    /// Configuration snapshot taken when the execution started
    pub config: Arc<RunConfiguration>,
    /// Telemetry sinks
    pub observer: ExecutionObserver,
}

impl ExecutionRequest {
    /// Request without telemetry sinks.
    #[must_use]
    pub fn new(tool: Arc<dyn Tool>, args: Value, context: ExecutionContext, config: Arc<RunConfiguration>) -> Self {
        Self {
            tool,
            args,
            context,
            config,
            observer: ExecutionObserver::default(),
        }
    }

    /// Attach telemetry sinks.
    #[must_use]
    pub fn with_observer(mut self, observer: ExecutionObserver) -> Self {
        self.observer = observer;
        self
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("tool", &self.tool.name())
            .field("args", &self.args)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Policy-bound executor for one tool category.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Category this strategy runs tools under.
    fn category(&self) -> &ToolCategory;

    /// Run one tool call under the strategy's policy.
    ///
    /// # Errors
    ///
    /// Returns [`ToolExecutionError`] once the retry policy and circuit
    /// breaker give up.
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, ToolExecutionError>;

    /// Circuit breakers this strategy owns.
    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        Vec::new()
    }

    /// Reset any circuit breakers to closed.
    fn reset_breakers(&self) {}
}

/// Built-in [`ExecutionStrategy`]: timeout, retry and circuit breaker taken
/// from the configuration for its category.
#[derive(Debug)]
pub struct PolicyStrategy {
    category: ToolCategory,
    connects: bool,
    hints: Vec<String>,
    breakers: BreakerSet,
}

impl PolicyStrategy {
    /// Strategy for any category. Network categories run the connection
    /// phase first.
    #[must_use]
    pub fn new(category: ToolCategory) -> Self {
        Self {
            connects: category.is_network(),
            breakers: BreakerSet::new(category.as_str()),
            category,
            hints: Vec::new(),
        }
    }

    /// Strategy for uncategorised tools.
    #[must_use]
    pub fn generic() -> Self {
        Self::new(ToolCategory::Generic)
    }

    /// Strategy for remote procedure servers.
    #[must_use]
    pub fn remote_procedure() -> Self {
        Self::new(ToolCategory::RemoteProcedure).with_hints([
            "Check that the remote procedure server is running",
            "Verify the server's connection parameters",
        ])
    }

    /// Strategy for HTTP/REST APIs.
    #[must_use]
    pub fn rest_api() -> Self {
        Self::new(ToolCategory::RestApi).with_hints([
            "Verify the API endpoint URL and authentication",
            "Check the API rate limits",
        ])
    }

    /// Strategy for in-process functions.
    #[must_use]
    pub fn local_function() -> Self {
        Self::new(ToolCategory::LocalFunction)
            .with_hints(["Check the function implementation for blocking calls"])
    }

    /// Add category-specific remediation hints to every error.
    #[must_use]
    pub fn with_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hints.extend(hints.into_iter().map(Into::into));
        self
    }

    /// Whether tools run their connection phase before each call.
    #[must_use]
    pub const fn with_connect_phase(mut self, connects: bool) -> Self {
        self.connects = connects;
        self
    }

    async fn attempt(
        tool: &dyn Tool,
        args: Value,
        connect_timeout: Option<Duration>,
        call_timeout: Duration,
    ) -> Result<Value, AttemptError> {
        if let Some(after) = connect_timeout {
            match tokio::time::timeout(after, tool.connect()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(AttemptError::Failed(err)),
                Err(source) => return Err(AttemptError::ConnectTimeout { after, source }),
            }
        }
        match tokio::time::timeout(call_timeout, tool.call(args)).await {
            Ok(result) => result.map_err(AttemptError::Failed),
            Err(source) => Err(AttemptError::Timeout {
                after: call_timeout,
                source,
            }),
        }
    }

    fn failure(&self, attempts: u32, error: AttemptError, context: ExecutionContext) -> ToolExecutionError {
        let (kind, message) = if attempts > 1 {
            (
                FailureKind::RetriesExhausted,
                format!("Tool execution failed after {attempts} attempts: {error}"),
            )
        } else {
            let message = match &error {
                AttemptError::ConnectTimeout { .. } => "Tool connection timed out".to_string(),
                AttemptError::Timeout { .. } => "Tool execution timed out".to_string(),
                AttemptError::Failed(err) => format!("Tool execution failed: {err}"),
            };
            (error.kind(), message)
        };

        let err = ToolExecutionError::new(kind, message, context)
            .with_tool_type(self.category.clone())
            .with_attempts(attempts)
            .with_fixes(self.hints.iter().cloned());
        match error {
            AttemptError::ConnectTimeout { after, source } | AttemptError::Timeout { after, source } => {
                err.with_timeout(after).with_source(OriginalError::new(source))
            }
            AttemptError::Failed(cause) => err.with_source(OriginalError::from_anyhow(cause)),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for PolicyStrategy {
    fn category(&self) -> &ToolCategory {
        &self.category
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<Value, ToolExecutionError> {
        let ExecutionRequest {
            tool,
            args,
            context,
            config,
            observer,
        } = request;
        let tool_name = tool.name().to_string();
        let category = &self.category;
        let call_timeout = config.timeout_for(&tool_name, category);
        let connect_timeout = self
            .connects
            .then(|| config.connection_timeout_for(category).unwrap_or(call_timeout));
        let executor = RetryExecutor::new(config.retry_policy_for(category));
        let max_attempts = executor.policy().max_attempts;
        let started = Instant::now();

        let breaker_timeout = (config.enable_circuit_breaker && !config.circuit_breaker.call_timeout.is_zero())
            .then_some(config.circuit_breaker.call_timeout);
        let permit = if config.enable_circuit_breaker {
            let key = match config.circuit_breaker.scope {
                BreakerScope::Category => category.as_str(),
                BreakerScope::Tool => tool_name.as_str(),
            };
            let breaker = self.breakers.get(key, &config.circuit_breaker);
            let Some(permit) = breaker.try_acquire() else {
                tracing::warn!(tool = %tool_name, breaker = breaker.name(), "Circuit breaker is OPEN, rejecting call");
                return Err(ToolExecutionError::new(
                    FailureKind::CircuitOpen,
                    format!("Circuit breaker '{}' is OPEN", breaker.name()),
                    context,
                )
                .with_tool_type(category.clone())
                .with_fixes(self.hints.iter().cloned()));
            };
            Some(permit)
        } else {
            None
        };

        let attempts_made = AtomicU32::new(0);
        let run = executor
            .run(
                |attempt| {
                    attempts_made.store(attempt, Ordering::Relaxed);
                    let tool = Arc::clone(&tool);
                    let args = args.clone();
                    let tool_name = tool_name.as_str();
                    let observer = &observer;
                    async move {
                        let attempt_started = Instant::now();
                        let result = Self::attempt(tool.as_ref(), args, connect_timeout, call_timeout).await;
                        observer.attempt_finished(
                            tool_name,
                            category,
                            attempt,
                            attempt_started.elapsed(),
                            result.is_ok(),
                        );
                        result
                    }
                },
                |attempt, error| {
                    if attempt < max_attempts {
                        RetryMetrics::record_attempt(category);
                    }
                    observer.attempt_failed(&AttemptFailure {
                        tool: &tool_name,
                        category,
                        attempt,
                        max_attempts,
                        error,
                        elapsed: started.elapsed(),
                        context: &context,
                    });
                },
            );

        let timed = match breaker_timeout {
            None => Ok(run.await),
            Some(after) => tokio::time::timeout(after, run).await.map_err(|source| (after, source)),
        };
        let outcome = match timed {
            Ok(outcome) => outcome,
            Err((after, source)) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                let err = ToolExecutionError::new(
                    FailureKind::Timeout,
                    format!("Circuit breaker call timed out after {:.1}s", after.as_secs_f64()),
                    context,
                )
                .with_tool_type(category.clone())
                .with_attempts(attempts_made.load(Ordering::Relaxed))
                .with_fixes(self.hints.iter().cloned())
                .with_timeout(after)
                .with_elapsed(started.elapsed())
                .with_source(OriginalError::new(source));
                tracing::warn!(tool = %tool_name, category = %category, code = err.error_code(), "Circuit breaker call timed out");
                return Err(err);
            }
        };

        match outcome {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                if attempts_made.load(Ordering::Relaxed) > 1 {
                    RetryMetrics::record_success(category);
                }
                Ok(value)
            }
            Err(exhausted) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                if exhausted.attempts > 1 {
                    RetryMetrics::record_exhausted(category);
                }
                let err = self
                    .failure(exhausted.attempts, exhausted.error, context)
                    .with_elapsed(started.elapsed());
                let err = if err.timeout_used().is_none() {
                    err.with_timeout(call_timeout)
                } else {
                    err
                };
                tracing::warn!(
                    tool = %tool_name,
                    category = %category,
                    attempts = err.attempts(),
                    code = err.error_code(),
                    "Tool execution failed"
                );
                Err(err)
            }
        }
    }

    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    fn reset_breakers(&self) {
        self.breakers.reset_all();
    }
}
