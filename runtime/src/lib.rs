//! # Toolguard Runtime
//!
//! Resilient execution of agent tools.
//!
//! This crate wraps every tool call in a per-category policy: a hard timeout
//! per attempt, a retry policy, and an optional circuit breaker. A bounded
//! admission gate caps how many tools run at once.
//!
//! ## Core Components
//!
//! - **Manager**: [`ToolExecutionManager`], the facade the agent runtime calls
//! - **Dispatcher**: maps a tool to the strategy for its category
//! - **Strategies**: policy-bound executors, one per category
//! - **Retry executor** and **circuit breaker**: the resilience primitives
//!   strategies are built from
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use std::sync::Arc;
//! use toolguard_core::context::ExecutionContext;
//! use toolguard_core::tool::FnTool;
//! use toolguard_runtime::ToolExecutionManager;
//!
//! # tokio_test::block_on(async {
//! let context = ExecutionContext::new("customer-support");
//! let manager = ToolExecutionManager::from_document(
//!     context.clone(),
//!     &json!({ "enable_circuit_breaker": true, "max_concurrent_tools": 2 }),
//! )
//! .unwrap();
//!
//! manager.register_tool(Arc::new(FnTool::new("lookup_order", |args| async move {
//!     Ok(json!({ "order": args["id"], "status": "shipped" }))
//! })));
//!
//! let result = manager
//!     .execute("lookup_order", None, json!({ "id": 42 }), &context.with_agent("triage"))
//!     .await
//!     .unwrap();
//! assert_eq!(result["status"], "shipped");
//! # });
//! ```

/// Bounded admission of concurrent executions
pub mod admission;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Strategy registry, dispatch rules and per-tool overrides
pub mod dispatch;

/// The tool execution facade
pub mod manager;

/// Prometheus metrics for observability
pub mod metrics;

/// Tool registry
pub mod registry;

/// Retry logic with configurable backoff
pub mod retry;

/// In-process execution statistics
pub mod stats;

/// Per-category execution strategies
pub mod strategy;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, State as CircuitState};
pub use dispatch::{Dispatch, DispatchRule, DispatchSource, Dispatcher, RuleMatcher};
pub use manager::{ExecutionError, ManagerDebugInfo, ToolExecutionManager};
pub use registry::ToolRegistry;
pub use retry::{RetryExecutor, RetryExhausted};
pub use stats::ExecutionMetrics;
pub use strategy::{AttemptError, AttemptFailure, ExecutionRequest, ExecutionStrategy, PolicyStrategy};
