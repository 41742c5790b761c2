//! The tool execution manager.
//!
//! [`ToolExecutionManager`] is the entry point the agent runtime calls. It owns
//! the tool registry, the dispatcher with its strategies and breakers, the live
//! configuration, the admission gate and the execution statistics. No state is
//! shared between managers.
//!
//! # Execution flow
//!
//! 1. Look the tool up in the registry
//! 2. Dispatch it to the strategy for its category
//! 3. Wait for an admission slot
//! 4. Run the strategy against the configuration snapshot taken at step 1
//! 5. Record statistics and metrics
//!
//! Dropping the future returned by [`ToolExecutionManager::execute`] cancels
//! the execution at whichever step it is in, and frees its admission slot.

use crate::admission::{AdmissionGate, AdmissionRejected};
use crate::circuit_breaker::BreakerSnapshot;
use crate::dispatch::{Dispatcher, RuleMatcher};
use crate::metrics::ToolMetrics;
use crate::registry::ToolRegistry;
use crate::stats::{ExecutionMetrics, ExecutionStats};
use crate::strategy::{AttemptFailedHook, AttemptFailure, ExecutionObserver, ExecutionRequest, ExecutionStrategy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use toolguard_core::config::{ConfigWarning, RunConfiguration};
use toolguard_core::context::ExecutionContext;
use toolguard_core::error::{
    ConfigurationError, DebugInfo, Diagnosable, FailureKind, RegistryError, ToolExecutionError,
};
use toolguard_core::tool::{Tool, ToolCategory};
use tracing::Instrument;
use uuid::Uuid;

/// Any error [`ToolExecutionManager`] returns.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The tool ran and failed, or was never admitted
    #[error(transparent)]
    Tool(#[from] ToolExecutionError),
    /// The tool or its category is not registered
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A configuration update was rejected
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl ExecutionError {
    /// Structured snapshot of the wrapped error.
    #[must_use]
    pub fn debug_info(&self) -> DebugInfo {
        match self {
            Self::Tool(err) => err.debug_info(),
            Self::Registry(err) => err.debug_info(),
            Self::Configuration(err) => err.debug_info(),
        }
    }

    /// Error code of the wrapped error.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        match self {
            Self::Tool(err) => Some(err.error_code().to_string()),
            Self::Registry(err) => err.details().error_code.clone(),
            Self::Configuration(err) => err.details().error_code.clone(),
        }
    }

    /// Context the error happened in.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        match self {
            Self::Tool(err) => err.context(),
            Self::Registry(err) => &err.details().context,
            Self::Configuration(err) => &err.details().context,
        }
    }
}

/// Admission gate occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    /// Concurrent executions allowed
    pub capacity: usize,
    /// Executions holding a slot
    pub in_flight: usize,
    /// Executions waiting for a slot
    pub waiting: usize,
}

/// Everything [`ToolExecutionManager::debug_info`] exposes.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerDebugInfo {
    /// Location of the manager's root context
    pub system: String,
    /// Live configuration as a nested map
    pub configuration: Value,
    /// Categories with a registered strategy
    pub strategies: Vec<String>,
    /// Dispatch rules in the order they are consulted
    pub dispatch_rules: Vec<String>,
    /// Per-tool category overrides
    pub tool_categories: BTreeMap<String, ToolCategory>,
    /// Registered tool names
    pub registered_tools: Vec<String>,
    /// Execution statistics
    pub metrics: ExecutionMetrics,
    /// State of every circuit breaker created so far
    pub circuit_breakers: Vec<BreakerSnapshot>,
    /// Admission gate occupancy
    pub admission: AdmissionSnapshot,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

/// Facade for resilient tool execution.
///
/// ## Example
///
/// ```
/// use serde_json::json;
/// use std::sync::Arc;
/// use toolguard_core::config::RunConfiguration;
/// use toolguard_core::context::ExecutionContext;
/// use toolguard_core::tool::FnTool;
/// use toolguard_runtime::manager::ToolExecutionManager;
///
/// # tokio_test::block_on(async {
/// let manager = ToolExecutionManager::new(ExecutionContext::new("support"), RunConfiguration::default());
/// manager.register_tool(Arc::new(FnTool::new("echo", |args| async move { Ok(args) })));
///
/// let value = manager
///     .execute("echo", None, json!({ "text": "hi" }), &ExecutionContext::new("support"))
///     .await
///     .unwrap();
/// assert_eq!(value, json!({ "text": "hi" }));
/// # });
/// ```
pub struct ToolExecutionManager {
    context: ExecutionContext,
    config: RwLock<Arc<RunConfiguration>>,
    tools: ToolRegistry,
    dispatcher: Dispatcher,
    admission: AdmissionGate,
    stats: Arc<ExecutionStats>,
    hooks: RwLock<Vec<AttemptFailedHook>>,
}

impl ToolExecutionManager {
    /// Manager with the built-in strategies and dispatch rules.
    ///
    /// `context` is the root context configuration errors are reported in.
    #[must_use]
    pub fn new(context: ExecutionContext, config: RunConfiguration) -> Self {
        let gate = AdmissionGate::new(config.max_concurrent_tools);
        tracing::info!(
            system = %context.system_name,
            max_concurrent_tools = gate.capacity(),
            circuit_breaker = config.enable_circuit_breaker,
            "Tool execution manager created"
        );
        Self {
            context,
            config: RwLock::new(Arc::new(config)),
            tools: ToolRegistry::new(),
            dispatcher: Dispatcher::new(),
            admission: gate,
            stats: Arc::new(ExecutionStats::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Manager configured from a nested map merged onto the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the document is malformed or, in
    /// strict mode, holds invalid values.
    pub fn from_document(context: ExecutionContext, document: &Value) -> Result<Self, ConfigurationError> {
        let loaded = RunConfiguration::from_document(document)
            .map_err(|err| err.with_context(context.clone()))?;
        Ok(Self::new(context, loaded.configuration))
    }

    /// Root context of this manager.
    #[must_use]
    pub const fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The live configuration.
    #[must_use]
    pub fn config(&self) -> Arc<RunConfiguration> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the configuration with `document` merged onto the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] and keeps the current configuration if
    /// the document is rejected.
    pub fn update_config(&self, document: &Value) -> Result<Vec<ConfigWarning>, ConfigurationError> {
        let loaded = RunConfiguration::from_document(document)
            .map_err(|err| err.with_context(self.context.clone()))?;
        self.set_config(loaded.configuration);
        Ok(loaded.warnings)
    }

    /// Merge `overlay` onto the live configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] and keeps the current configuration if
    /// the merged document is rejected.
    pub fn merge_config(&self, overlay: &Value) -> Result<Vec<ConfigWarning>, ConfigurationError> {
        let loaded = self
            .config()
            .merge(overlay)
            .map_err(|err| err.with_context(self.context.clone()))?;
        self.set_config(loaded.configuration);
        Ok(loaded.warnings)
    }

    /// Install a typed configuration. Executions already running keep the
    /// configuration they started with.
    pub fn set_config(&self, config: RunConfiguration) {
        if self.admission.capacity() != config.max_concurrent_tools.max(1) {
            self.admission.resize(config.max_concurrent_tools);
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        tracing::info!(system = %self.context.system_name, "Configuration updated");
    }

    /// Call `hook` after every failed attempt, the last one included.
    pub fn on_attempt_failed<F>(&self, hook: F)
    where
        F: Fn(&AttemptFailure<'_>) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Register a tool. Returns `true` if it replaced one with the same name.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        let replaced = self.tools.register(tool);
        tracing::debug!(tool = %name, replaced, "Registered tool");
        replaced
    }

    /// Remove a tool. Returns `false` if it was not registered.
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.unregister(name)
    }

    /// The tool registry.
    #[must_use]
    pub const fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Register or replace the strategy for a category.
    pub fn register_strategy(&self, category: ToolCategory, strategy: Arc<dyn ExecutionStrategy>) {
        self.dispatcher.register_strategy(category, strategy);
    }

    /// Add a dispatch rule ahead of the existing ones.
    pub fn register_dispatch_rule(&self, matcher: RuleMatcher, category: ToolCategory) {
        self.dispatcher.register_rule(matcher, category);
    }

    /// Pin a tool to a category.
    pub fn set_tool_category(&self, tool_name: impl Into<String>, category: ToolCategory) {
        self.dispatcher.set_tool_category(tool_name, category);
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Execute a registered tool.
    ///
    /// `category` overrides dispatch when given. An invocation id is generated
    /// unless `context` already carries one.
    ///
    /// # Errors
    ///
    /// - [`ExecutionError::Registry`] if the tool or its category's strategy is
    ///   not registered
    /// - [`ExecutionError::Tool`] if admission is refused or the strategy gives up
    pub async fn execute(
        &self,
        tool_name: &str,
        category: Option<&ToolCategory>,
        args: Value,
        context: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let invocation_id = context
            .invocation_id
            .clone()
            .unwrap_or_else(|| format!("inv_{}", Uuid::new_v4().simple()));
        let context = context.with_tool(tool_name).with_invocation_id(invocation_id.as_str());
        let span = tracing::info_span!(
            "tool_execution",
            tool = %tool_name,
            invocation_id = %invocation_id,
            category = tracing::field::Empty,
        );
        self.run(tool_name, category, args, context).instrument(span).await
    }

    async fn run(
        &self,
        tool_name: &str,
        category: Option<&ToolCategory>,
        args: Value,
        context: ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let config = self.config();
        let started = Instant::now();

        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| RegistryError::unknown_tool(tool_name, context.clone()))?;
        let dispatch = self.dispatcher.select(tool.as_ref(), category, &context)?;
        tracing::Span::current().record("category", tracing::field::display(&dispatch.category));

        let _slot = match self
            .admission
            .acquire(config.tool_execution_queue_size, config.admission_timeout)
            .await
        {
            Ok(slot) => slot,
            Err(rejected) => {
                let err = Self::rejected(rejected, &dispatch.category, context);
                self.finish(tool_name, &dispatch.category, started, Some(&err));
                return Err(err.into());
            }
        };

        if config.debug.enabled {
            tracing::info!(args = %args, source = ?dispatch.source, "Executing tool");
        }

        let observer = ExecutionObserver::new(
            self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone(),
            Some(Arc::clone(&self.stats)),
        )
        .with_attempt_tracing(config.debug.trace_tool_execution);
        let request = ExecutionRequest::new(tool, args, context, config).with_observer(observer);

        let outcome = dispatch.strategy.execute(request).await;
        self.finish(tool_name, &dispatch.category, started, outcome.as_ref().err());
        Ok(outcome?)
    }

    fn rejected(rejected: AdmissionRejected, category: &ToolCategory, context: ExecutionContext) -> ToolExecutionError {
        let err = match rejected {
            AdmissionRejected::QueueFull { queue_size } => ToolExecutionError::new(
                FailureKind::QueueFull,
                format!("Tool execution queue is full ({queue_size} waiting)"),
                context,
            ),
            AdmissionRejected::Timeout { after } => ToolExecutionError::new(
                FailureKind::AdmissionTimeout,
                format!("No execution slot became free within {:.1}s", after.as_secs_f64()),
                context,
            )
            .with_timeout(after),
        };
        tracing::warn!(code = err.error_code(), "Tool execution not admitted");
        err.with_tool_type(category.clone())
    }

    fn finish(&self, tool_name: &str, category: &ToolCategory, started: Instant, error: Option<&ToolExecutionError>) {
        let elapsed = started.elapsed();
        self.stats.record_invocation(elapsed, error.is_some());
        ToolMetrics::record_invocation(tool_name, category, elapsed);
        if let Some(err) = error {
            ToolMetrics::record_error(tool_name, err.error_code());
        }
    }

    /// Execution statistics.
    #[must_use]
    pub fn metrics(&self) -> ExecutionMetrics {
        self.stats.snapshot()
    }

    /// Zero the execution statistics.
    pub fn reset_metrics(&self) {
        self.stats.reset();
    }

    /// Close every circuit breaker of every strategy.
    pub fn reset_circuit_breakers(&self) {
        for strategy in self.dispatcher.strategies().values() {
            strategy.reset_breakers();
        }
        tracing::info!("Circuit breakers reset");
    }

    /// State of every circuit breaker created so far.
    #[must_use]
    pub fn circuit_breakers(&self) -> Vec<BreakerSnapshot> {
        self.dispatcher
            .strategies()
            .values()
            .flat_map(|strategy| strategy.breaker_snapshots())
            .collect()
    }

    /// Admission gate occupancy.
    #[must_use]
    pub fn admission(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            capacity: self.admission.capacity(),
            in_flight: self.admission.in_flight(),
            waiting: self.admission.waiting(),
        }
    }

    /// Snapshot of the manager's live state.
    #[must_use]
    pub fn debug_info(&self) -> ManagerDebugInfo {
        ManagerDebugInfo {
            system: self.context.location(),
            configuration: self.config().to_document(),
            strategies: self.dispatcher.strategies().into_keys().collect(),
            dispatch_rules: self
                .dispatcher
                .rules()
                .iter()
                .map(|rule| format!("{} -> {}", rule.matcher, rule.category))
                .collect(),
            tool_categories: self.dispatcher.overrides(),
            registered_tools: self.tools.list_tools(),
            metrics: self.metrics(),
            circuit_breakers: self.circuit_breakers(),
            admission: self.admission(),
            captured_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ToolExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutionManager")
            .field("context", &self.context)
            .field("tools", &self.tools)
            .field("dispatcher", &self.dispatcher)
            .field("admission", &self.admission())
            .finish_non_exhaustive()
    }
}
