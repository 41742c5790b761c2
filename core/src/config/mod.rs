//! Layered configuration for tool execution.
//!
//! A [`RunConfiguration`] parameterizes timeouts, retry policies and circuit
//! breaking. It is produced from a nested map (usually parsed from YAML or
//! JSON upstream) by a recursive-override merge onto the defaults: scalars
//! replace, maps merge key-wise, unset keys inherit.
//!
//! Values are validated at this boundary. In strict mode (the default) any
//! invalid value fails the load with a [`ConfigurationError`]; with
//! `strict_mode: false` invalid values are clamped and reported as
//! [`ConfigWarning`]s.
//!
//! # Example
//!
//! ```
//! use toolguard_core::config::RunConfiguration;
//! use toolguard_core::tool::ToolCategory;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let loaded = RunConfiguration::from_document(&json!({
//!     "tool_timeouts": { "tools": { "slow_report": 120 } },
//!     "retry_policies": { "default": { "max_attempts": 2 } },
//! }))?;
//! let config = loaded.configuration;
//!
//! assert_eq!(
//!     config.timeout_for("slow_report", &ToolCategory::LocalFunction),
//!     Duration::from_secs(120)
//! );
//! assert_eq!(config.retry_policy_for(&ToolCategory::LocalFunction).max_attempts, 2);
//! # Ok::<(), toolguard_core::error::ConfigurationError>(())
//! ```

mod document;
pub mod merge;

use crate::error::ConfigurationError;
use crate::tool::ToolCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timeout used when neither a per-tool nor a per-category value applies.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Key of the retry policy every configuration must contain.
pub const DEFAULT_POLICY: &str = "default";

/// Per-category and per-tool timeouts.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolTimeoutPolicy {
    /// Default call timeout per category
    pub categories: BTreeMap<ToolCategory, Duration>,
    /// Connection-establishment timeout per category
    pub connection: BTreeMap<ToolCategory, Duration>,
    /// Overrides by tool name; always win over the category value
    pub tools: BTreeMap<String, Duration>,
}

impl Default for ToolTimeoutPolicy {
    fn default() -> Self {
        Self {
            categories: BTreeMap::from([
                (ToolCategory::Generic, Duration::from_secs(30)),
                (ToolCategory::RemoteProcedure, Duration::from_secs(30)),
                (ToolCategory::RestApi, Duration::from_secs(60)),
                (ToolCategory::LocalFunction, Duration::from_secs(10)),
            ]),
            connection: BTreeMap::from([
                (ToolCategory::RemoteProcedure, Duration::from_secs(10)),
                (ToolCategory::RestApi, Duration::from_secs(15)),
            ]),
            tools: BTreeMap::new(),
        }
    }
}

impl ToolTimeoutPolicy {
    /// Resolve the call timeout: per-tool override, then category value,
    /// then [`FALLBACK_TIMEOUT`].
    #[must_use]
    pub fn timeout_for(&self, tool_name: &str, category: &ToolCategory) -> Duration {
        self.tools
            .get(tool_name)
            .or_else(|| self.categories.get(category))
            .copied()
            .unwrap_or(FALLBACK_TIMEOUT)
    }

    /// Connection-establishment timeout for a category, if it has one.
    #[must_use]
    pub fn connection_timeout_for(&self, category: &ToolCategory) -> Option<Duration> {
        self.connection.get(category).copied()
    }
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry without waiting
    Immediate,
    /// Wait `base_delay` every time
    FixedDelay,
    /// Wait `base_delay * attempt`
    LinearBackoff,
    /// Wait `base_delay * multiplier^(attempt - 1)`
    ExponentialBackoff,
}

impl RetryStrategy {
    /// Document key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::FixedDelay => "fixed_delay",
            Self::LinearBackoff => "linear_backoff",
            Self::ExponentialBackoff => "exponential_backoff",
        }
    }
}

/// Retry policy for one operation type.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `strategy`: exponential backoff
/// - `base_delay`: 1s, `max_delay`: 60s, `backoff_multiplier`: 2.0
/// - `jitter`: enabled
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retrying
    pub max_attempts: u32,
    /// Delay growth
    pub strategy: RetryStrategy,
    /// Base delay
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.5)`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::ExponentialBackoff,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            strategy: RetryStrategy::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Retry immediately, up to `max_attempts` in total.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    /// Fixed delay between attempts, without jitter.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::FixedDelay,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
            ..Self::default()
        }
    }

    /// Exponential backoff, without jitter.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::ExponentialBackoff,
            base_delay,
            max_delay,
            backoff_multiplier: multiplier,
            jitter: false,
        }
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// What a circuit breaker is keyed by inside a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker per strategy category
    #[default]
    Category,
    /// One breaker per tool name
    Tool,
}

impl BreakerScope {
    /// Document key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Tool => "tool",
        }
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call is let through
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Deadline for a guarded call; zero disables it
    pub call_timeout: Duration,
    /// Breaker key granularity
    pub scope: BreakerScope,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
            scope: BreakerScope::Category,
        }
    }
}

/// Debug and tracing switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// Log the start and end of every execution at info level
    pub enabled: bool,
    /// Log every attempt at info level instead of debug
    pub trace_tool_execution: bool,
}

/// Complete execution configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    /// Timeouts
    pub tool_timeouts: ToolTimeoutPolicy,
    /// Retry policies keyed by category key or `"default"`
    pub retry_policies: BTreeMap<String, RetryPolicy>,
    /// Whether strategies guard calls with circuit breakers
    pub enable_circuit_breaker: bool,
    /// Circuit breaker parameters
    pub circuit_breaker: CircuitBreakerPolicy,
    /// Maximum concurrent tool executions
    pub max_concurrent_tools: usize,
    /// Maximum executions waiting for a slot
    pub tool_execution_queue_size: usize,
    /// How long an execution may wait for a slot; `None` waits indefinitely
    pub admission_timeout: Option<Duration>,
    /// Fail on invalid values instead of clamping them
    pub strict_mode: bool,
    /// Debug switches
    pub debug: DebugConfig,
    /// Unknown top-level keys, preserved for the host runtime
    pub extra: BTreeMap<String, Value>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            tool_timeouts: ToolTimeoutPolicy::default(),
            retry_policies: BTreeMap::from([
                (DEFAULT_POLICY.to_string(), RetryPolicy::default()),
                (
                    ToolCategory::RemoteProcedure.as_str().to_string(),
                    RetryPolicy {
                        max_attempts: 2,
                        base_delay: Duration::from_millis(500),
                        max_delay: Duration::from_secs(5),
                        ..RetryPolicy::default()
                    },
                ),
                (
                    ToolCategory::RestApi.as_str().to_string(),
                    RetryPolicy {
                        max_attempts: 3,
                        base_delay: Duration::from_secs(1),
                        max_delay: Duration::from_secs(30),
                        ..RetryPolicy::default()
                    },
                ),
            ]),
            enable_circuit_breaker: false,
            circuit_breaker: CircuitBreakerPolicy::default(),
            max_concurrent_tools: 5,
            tool_execution_queue_size: 100,
            admission_timeout: None,
            strict_mode: true,
            debug: DebugConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

/// A value that was clamped during lenient loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    /// Dotted path of the offending value
    pub section: String,
    /// What was wrong and what it was clamped to
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.section, self.message)
    }
}

/// Result of loading or merging a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfiguration {
    /// The validated configuration
    pub configuration: RunConfiguration,
    /// Values clamped in lenient mode
    pub warnings: Vec<ConfigWarning>,
}

impl RunConfiguration {
    /// Build a configuration from a nested map, merged onto the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the document is malformed, or holds
    /// invalid values while `strict_mode` is on.
    pub fn from_document(document: &Value) -> Result<LoadedConfiguration, ConfigurationError> {
        Self::default().merge(document)
    }

    /// Merge an overlay map onto this configuration, producing a new one.
    ///
    /// `self` is left untouched. Merging an empty overlay yields an equal
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the overlay is not a map, the merged
    /// document is malformed, or it holds invalid values in strict mode.
    pub fn merge(&self, overlay: &Value) -> Result<LoadedConfiguration, ConfigurationError> {
        let mut merged = self.to_document();
        match overlay {
            Value::Null => {}
            Value::Object(_) => merge::deep_merge(&mut merged, overlay),
            _ => {
                return Err(ConfigurationError::invalid(
                    None,
                    vec!["configuration overlay must be a map".to_string()],
                ));
            }
        }
        document::parse(merged)
    }

    /// Check a programmatically built configuration, as strict loading would.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] listing every invalid value.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut document = self.to_document();
        if let Value::Object(map) = &mut document {
            map.insert("strict_mode".to_string(), Value::Bool(true));
        }
        document::parse(document).map(|_| ())
    }

    /// Render as the canonical nested map, durations in float seconds.
    #[must_use]
    pub fn to_document(&self) -> Value {
        document::render(self)
    }

    /// Call timeout for a tool.
    #[must_use]
    pub fn timeout_for(&self, tool_name: &str, category: &ToolCategory) -> Duration {
        self.tool_timeouts.timeout_for(tool_name, category)
    }

    /// Connection timeout for a category, if it has one.
    #[must_use]
    pub fn connection_timeout_for(&self, category: &ToolCategory) -> Option<Duration> {
        self.tool_timeouts.connection_timeout_for(category)
    }

    /// Retry policy for a category, falling back to `"default"`.
    #[must_use]
    pub fn retry_policy_for(&self, category: &ToolCategory) -> RetryPolicy {
        self.retry_policies
            .get(category.as_str())
            .or_else(|| self.retry_policies.get(DEFAULT_POLICY))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(document: Value) -> LoadedConfiguration {
        RunConfiguration::from_document(&document).expect("document should load")
    }

    #[test]
    fn test_defaults() {
        let config = RunConfiguration::default();
        assert_eq!(config.timeout_for("x", &ToolCategory::RestApi), Duration::from_secs(60));
        assert_eq!(config.timeout_for("x", &ToolCategory::LocalFunction), Duration::from_secs(10));
        assert_eq!(
            config.connection_timeout_for(&ToolCategory::RemoteProcedure),
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.connection_timeout_for(&ToolCategory::LocalFunction), None);
        assert_eq!(config.retry_policy_for(&ToolCategory::RemoteProcedure).max_attempts, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_with_empty_overlay_is_identity() {
        let base = load(json!({
            "tool_timeouts": { "tools": { "t": 0.25 } },
            "retry_policies": { "custom": { "max_attempts": 4, "strategy": "fixed_delay", "base_delay": 0.01 } },
            "max_llm_calls": 200,
        }))
        .configuration;

        let merged = base.merge(&json!({})).expect("merge succeeds");
        assert_eq!(merged.configuration, base);
        assert!(merged.warnings.is_empty());

        let merged = base.merge(&Value::Null).expect("merge succeeds");
        assert_eq!(merged.configuration, base);
    }

    #[test]
    fn test_merge_does_not_modify_base() {
        let base = RunConfiguration::default();
        let merged = base
            .merge(&json!({ "max_concurrent_tools": 9, "enable_circuit_breaker": true }))
            .expect("merge succeeds")
            .configuration;

        assert_eq!(base.max_concurrent_tools, 5);
        assert!(!base.enable_circuit_breaker);
        assert_eq!(merged.max_concurrent_tools, 9);
        assert!(merged.enable_circuit_breaker);
    }

    #[test]
    fn test_nested_keys_inherit() {
        let config = load(json!({
            "retry_policies": { "default": { "max_attempts": 7 } },
            "circuit_breaker_config": { "failure_threshold": 2 },
        }))
        .configuration;

        let default = config.retry_policy_for(&ToolCategory::Generic);
        assert_eq!(default.max_attempts, 7);
        assert_eq!(default.base_delay, Duration::from_secs(1));
        assert_eq!(default.strategy, RetryStrategy::ExponentialBackoff);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        // Untouched entries survive.
        assert_eq!(config.retry_policy_for(&ToolCategory::RestApi).max_attempts, 3);
    }

    #[test]
    fn test_tool_override_wins_regardless_of_magnitude() {
        let config = load(json!({
            "tool_timeouts": {
                "categories": { "rest_api": 60 },
                "tools": { "fast": 0.5, "slow": 600 },
            },
        }))
        .configuration;

        assert_eq!(config.timeout_for("fast", &ToolCategory::RestApi), Duration::from_millis(500));
        assert_eq!(config.timeout_for("slow", &ToolCategory::RestApi), Duration::from_secs(600));
        assert_eq!(config.timeout_for("other", &ToolCategory::RestApi), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_category_uses_fallback_timeout() {
        let config = RunConfiguration::default();
        let custom = ToolCategory::Custom("vector_db".into());
        assert_eq!(config.timeout_for("search", &custom), FALLBACK_TIMEOUT);
        assert_eq!(config.retry_policy_for(&custom), RetryPolicy::default());
    }

    #[test]
    fn test_custom_category_timeout() {
        let config = load(json!({
            "tool_timeouts": { "categories": { "vector_db": 3 } },
        }))
        .configuration;
        let custom = ToolCategory::Custom("vector_db".into());
        assert_eq!(config.timeout_for("search", &custom), Duration::from_secs(3));
    }

    #[test]
    fn test_strict_mode_rejects_invalid_values() {
        let err = RunConfiguration::from_document(&json!({
            "retry_policies": { "default": { "max_attempts": 0, "base_delay": -1.0 } },
        }))
        .expect_err("strict mode rejects");

        assert_eq!(err.section(), Some("retry_policies.default.max_attempts"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn test_strict_mode_rejects_max_delay_below_base_delay() {
        let err = RunConfiguration::from_document(&json!({
            "retry_policies": { "default": { "base_delay": 5.0, "max_delay": 1.0 } },
        }))
        .expect_err("strict mode rejects");
        assert!(err.issues()[0].contains("max_delay"));
    }

    #[test]
    fn test_lenient_mode_clamps_and_warns() {
        let loaded = load(json!({
            "strict_mode": false,
            "retry_policies": {
                "default": { "max_attempts": 0, "base_delay": 2.0, "max_delay": 1.0, "backoff_multiplier": 0.5 },
            },
            "circuit_breaker_config": { "failure_threshold": 0 },
            "max_concurrent_tools": 0,
        }));

        let policy = loaded.configuration.retry_policy_for(&ToolCategory::Generic);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(loaded.configuration.circuit_breaker.failure_threshold, 1);
        assert_eq!(loaded.configuration.max_concurrent_tools, 1);
        assert_eq!(loaded.warnings.len(), 5);
        assert!(loaded
            .warnings
            .iter()
            .any(|w| w.section == "retry_policies.default.max_attempts"));
    }

    #[test]
    fn test_malformed_document_fails_in_any_mode() {
        let err = RunConfiguration::from_document(&json!({
            "strict_mode": false,
            "retry_policies": { "default": { "strategy": "sometimes" } },
        }))
        .expect_err("unknown strategy is malformed");
        assert!(err.issues().is_empty());
        assert!(err.to_string().contains("Malformed configuration document"));

        let err = RunConfiguration::default()
            .merge(&json!([1, 2]))
            .expect_err("overlay must be a map");
        assert!(err.to_string().contains("overlay must be a map"));
    }

    #[test]
    fn test_unknown_top_level_keys_are_preserved() {
        let config = load(json!({ "max_llm_calls": 200, "streaming_mode": "NONE" })).configuration;
        assert_eq!(config.extra.get("max_llm_calls"), Some(&json!(200)));
        assert_eq!(config.to_document()["streaming_mode"], json!("NONE"));
    }

    #[test]
    fn test_validate_catches_programmatic_mistakes() {
        let mut config = RunConfiguration::default();
        config.retry_policies.remove(DEFAULT_POLICY);
        config.strict_mode = false;

        let err = config.validate().expect_err("default policy is required");
        assert!(err.issues()[0].contains("default"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_merge_with_empty_overlay_is_identity(
                max_concurrent in 1i64..64,
                queue in 0i64..1000,
                attempts in 1i64..10,
                timeout_ms in 1u64..120_000,
            ) {
                let loaded = RunConfiguration::from_document(&json!({
                    "max_concurrent_tools": max_concurrent,
                    "tool_execution_queue_size": queue,
                    "retry_policies": { "default": { "max_attempts": attempts } },
                    "tool_timeouts": { "tools": { "nightly_report": Duration::from_millis(timeout_ms).as_secs_f64() } },
                }))
                .expect("valid document");

                let merged = loaded.configuration.merge(&json!({})).expect("empty overlay");
                prop_assert_eq!(merged.configuration, loaded.configuration);
            }

            #[test]
            fn prop_tool_override_always_wins(tool_ms in 1u64..100_000, category_ms in 1u64..100_000) {
                let mut timeouts = ToolTimeoutPolicy::default();
                timeouts.categories.insert(ToolCategory::RestApi, Duration::from_millis(category_ms));
                timeouts.tools.insert("nightly_report".to_string(), Duration::from_millis(tool_ms));

                prop_assert_eq!(
                    timeouts.timeout_for("nightly_report", &ToolCategory::RestApi),
                    Duration::from_millis(tool_ms)
                );
            }
        }
    }
}
