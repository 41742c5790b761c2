//! Nested-map form of [`RunConfiguration`] and its validation.
//!
//! Durations are float seconds. Counts are read as signed integers so that
//! negative values can be reported instead of failing as type errors.

use super::{
    BreakerScope, CircuitBreakerPolicy, ConfigWarning, DebugConfig, LoadedConfiguration,
    RetryPolicy, RetryStrategy, RunConfiguration, ToolTimeoutPolicy, DEFAULT_POLICY,
    FALLBACK_TIMEOUT,
};
use crate::error::ConfigurationError;
use crate::tool::ToolCategory;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTimeouts {
    categories: BTreeMap<String, f64>,
    connection: BTreeMap<String, f64>,
    tools: BTreeMap<String, f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRetryPolicy {
    max_attempts: Option<i64>,
    strategy: Option<RetryStrategy>,
    base_delay: Option<f64>,
    max_delay: Option<f64>,
    backoff_multiplier: Option<f64>,
    jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBreakerPolicy {
    failure_threshold: Option<i64>,
    recovery_timeout: Option<f64>,
    success_threshold: Option<i64>,
    call_timeout: Option<f64>,
    scope: Option<BreakerScope>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    tool_timeouts: RawTimeouts,
    #[serde(default)]
    retry_policies: BTreeMap<String, RawRetryPolicy>,
    #[serde(default)]
    enable_circuit_breaker: bool,
    #[serde(default)]
    circuit_breaker_config: RawBreakerPolicy,
    max_concurrent_tools: Option<i64>,
    tool_execution_queue_size: Option<i64>,
    #[serde(default)]
    admission_timeout: Option<f64>,
    strict_mode: Option<bool>,
    #[serde(default)]
    debug: DebugConfig,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Collects invalid values. Strict mode turns them into one error, lenient
/// mode into warnings next to the clamped value.
struct Validator {
    strict: bool,
    issues: Vec<(String, String)>,
    warnings: Vec<ConfigWarning>,
}

impl Validator {
    const fn new(strict: bool) -> Self {
        Self {
            strict,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn report(&mut self, section: String, problem: String, clamped_to: &str) {
        if self.strict {
            self.issues.push((section, problem));
        } else {
            let message = format!("{problem}; clamped to {clamped_to}");
            tracing::warn!(section = %section, "Invalid configuration value: {message}");
            self.warnings.push(ConfigWarning { section, message });
        }
    }

    /// Non-negative seconds; anything else is clamped to `fallback`.
    fn duration(&mut self, section: String, secs: f64, fallback: Duration) -> Duration {
        match seconds_to_duration(secs) {
            Some(duration) => duration,
            None => {
                self.report(
                    section,
                    format!("must be a non-negative number of seconds (got {secs})"),
                    &format!("{}s", fallback.as_secs_f64()),
                );
                fallback
            }
        }
    }

    /// Positive seconds; zero is rejected too.
    #[allow(clippy::float_cmp)]
    fn timeout(&mut self, section: String, secs: f64) -> Duration {
        if secs == 0.0 {
            self.report(
                section,
                "must be greater than 0 seconds".to_string(),
                &format!("{}s", FALLBACK_TIMEOUT.as_secs_f64()),
            );
            return FALLBACK_TIMEOUT;
        }
        self.duration(section, secs, FALLBACK_TIMEOUT)
    }

    fn count(&mut self, section: String, value: i64, min: i64) -> i64 {
        if value < min {
            self.report(section, format!("must be >= {min} (got {value})"), &min.to_string());
            min
        } else {
            value
        }
    }

    fn finish(self, configuration: RunConfiguration) -> Result<LoadedConfiguration, ConfigurationError> {
        if self.issues.is_empty() {
            return Ok(LoadedConfiguration {
                configuration,
                warnings: self.warnings,
            });
        }
        let section = self.issues.first().map(|(section, _)| section.clone());
        let issues = self
            .issues
            .into_iter()
            .map(|(section, problem)| format!("{section} {problem}"))
            .collect();
        Err(ConfigurationError::invalid(section, issues))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let nanos = (secs * 1e9).round();
    if nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

fn saturating_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn saturating_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Parse and validate a complete document.
pub(super) fn parse(document: Value) -> Result<LoadedConfiguration, ConfigurationError> {
    let raw: RawDocument =
        serde_json::from_value(document).map_err(|err| ConfigurationError::malformed(None, err))?;
    let defaults = RunConfiguration::default();
    let mut v = Validator::new(raw.strict_mode.unwrap_or(defaults.strict_mode));

    let tool_timeouts = parse_timeouts(&mut v, raw.tool_timeouts);

    let mut retry_policies = BTreeMap::new();
    for (key, policy) in raw.retry_policies {
        let parsed = parse_retry_policy(&mut v, &key, policy);
        retry_policies.insert(key, parsed);
    }
    if !retry_policies.contains_key(DEFAULT_POLICY) {
        v.report(
            "retry_policies".to_string(),
            format!("must contain a \"{DEFAULT_POLICY}\" entry"),
            "the built-in default policy",
        );
        retry_policies.insert(DEFAULT_POLICY.to_string(), RetryPolicy::default());
    }

    let circuit_breaker = parse_breaker(&mut v, raw.circuit_breaker_config);

    let max_concurrent_tools = raw.max_concurrent_tools.map_or(defaults.max_concurrent_tools, |n| {
        saturating_usize(v.count("max_concurrent_tools".to_string(), n, 1))
    });
    let tool_execution_queue_size = raw
        .tool_execution_queue_size
        .map_or(defaults.tool_execution_queue_size, |n| {
            saturating_usize(v.count("tool_execution_queue_size".to_string(), n, 0))
        });
    let admission_timeout = raw
        .admission_timeout
        .map(|secs| v.timeout("admission_timeout".to_string(), secs));

    let configuration = RunConfiguration {
        tool_timeouts,
        retry_policies,
        enable_circuit_breaker: raw.enable_circuit_breaker,
        circuit_breaker,
        max_concurrent_tools,
        tool_execution_queue_size,
        admission_timeout,
        strict_mode: v.strict,
        debug: raw.debug,
        extra: raw.extra,
    };
    v.finish(configuration)
}

fn parse_timeouts(v: &mut Validator, raw: RawTimeouts) -> ToolTimeoutPolicy {
    let categories = raw
        .categories
        .into_iter()
        .map(|(key, secs)| {
            let timeout = v.timeout(format!("tool_timeouts.categories.{key}"), secs);
            (ToolCategory::from(key.as_str()), timeout)
        })
        .collect();
    let connection = raw
        .connection
        .into_iter()
        .map(|(key, secs)| {
            let timeout = v.timeout(format!("tool_timeouts.connection.{key}"), secs);
            (ToolCategory::from(key.as_str()), timeout)
        })
        .collect();
    let tools = raw
        .tools
        .into_iter()
        .map(|(name, secs)| {
            let timeout = v.timeout(format!("tool_timeouts.tools.{name}"), secs);
            (name, timeout)
        })
        .collect();
    ToolTimeoutPolicy {
        categories,
        connection,
        tools,
    }
}

fn parse_retry_policy(v: &mut Validator, key: &str, raw: RawRetryPolicy) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    let section = |field: &str| format!("retry_policies.{key}.{field}");

    let max_attempts = raw
        .max_attempts
        .map_or(defaults.max_attempts, |n| saturating_u32(v.count(section("max_attempts"), n, 1)));
    let strategy = raw.strategy.unwrap_or(defaults.strategy);
    let base_delay = raw
        .base_delay
        .map_or(defaults.base_delay, |secs| v.duration(section("base_delay"), secs, Duration::ZERO));
    let mut max_delay = raw
        .max_delay
        .map_or(defaults.max_delay, |secs| v.duration(section("max_delay"), secs, base_delay));
    if max_delay < base_delay {
        v.report(
            section("max_delay"),
            format!(
                "must be >= base_delay ({}s < {}s)",
                max_delay.as_secs_f64(),
                base_delay.as_secs_f64()
            ),
            &format!("{}s", base_delay.as_secs_f64()),
        );
        max_delay = base_delay;
    }
    let mut backoff_multiplier = raw.backoff_multiplier.unwrap_or(defaults.backoff_multiplier);
    if strategy == RetryStrategy::ExponentialBackoff
        && !(backoff_multiplier.is_finite() && backoff_multiplier > 1.0)
    {
        v.report(
            section("backoff_multiplier"),
            format!("must be > 1.0 for exponential backoff (got {backoff_multiplier})"),
            &defaults.backoff_multiplier.to_string(),
        );
        backoff_multiplier = defaults.backoff_multiplier;
    }

    RetryPolicy {
        max_attempts,
        strategy,
        base_delay,
        max_delay,
        backoff_multiplier,
        jitter: raw.jitter.unwrap_or(defaults.jitter),
    }
}

fn parse_breaker(v: &mut Validator, raw: RawBreakerPolicy) -> CircuitBreakerPolicy {
    let defaults = CircuitBreakerPolicy::default();
    let section = |field: &str| format!("circuit_breaker_config.{field}");

    CircuitBreakerPolicy {
        failure_threshold: raw.failure_threshold.map_or(defaults.failure_threshold, |n| {
            saturating_u32(v.count(section("failure_threshold"), n, 1))
        }),
        recovery_timeout: raw.recovery_timeout.map_or(defaults.recovery_timeout, |secs| {
            v.duration(section("recovery_timeout"), secs, defaults.recovery_timeout)
        }),
        success_threshold: raw.success_threshold.map_or(defaults.success_threshold, |n| {
            saturating_u32(v.count(section("success_threshold"), n, 1))
        }),
        call_timeout: raw.call_timeout.map_or(defaults.call_timeout, |secs| {
            v.duration(section("call_timeout"), secs, defaults.call_timeout)
        }),
        scope: raw.scope.unwrap_or(defaults.scope),
    }
}

fn seconds_map<'a, K: AsRef<str> + 'a>(entries: impl Iterator<Item = (&'a K, &'a Duration)>) -> Value {
    Value::Object(
        entries
            .map(|(key, duration)| (key.as_ref().to_string(), json!(duration.as_secs_f64())))
            .collect(),
    )
}

/// Render the canonical document.
pub(super) fn render(config: &RunConfiguration) -> Value {
    let timeouts = &config.tool_timeouts;
    let retry_policies: Map<String, Value> = config
        .retry_policies
        .iter()
        .map(|(key, policy)| {
            (
                key.clone(),
                json!({
                    "max_attempts": policy.max_attempts,
                    "strategy": policy.strategy.as_str(),
                    "base_delay": policy.base_delay.as_secs_f64(),
                    "max_delay": policy.max_delay.as_secs_f64(),
                    "backoff_multiplier": policy.backoff_multiplier,
                    "jitter": policy.jitter,
                }),
            )
        })
        .collect();
    let breaker = &config.circuit_breaker;

    let mut document = Map::new();
    for (key, value) in &config.extra {
        document.insert(key.clone(), value.clone());
    }
    document.insert(
        "tool_timeouts".to_string(),
        json!({
            "categories": seconds_map(timeouts.categories.iter()),
            "connection": seconds_map(timeouts.connection.iter()),
            "tools": seconds_map(timeouts.tools.iter()),
        }),
    );
    document.insert("retry_policies".to_string(), Value::Object(retry_policies));
    document.insert(
        "enable_circuit_breaker".to_string(),
        json!(config.enable_circuit_breaker),
    );
    document.insert(
        "circuit_breaker_config".to_string(),
        json!({
            "failure_threshold": breaker.failure_threshold,
            "recovery_timeout": breaker.recovery_timeout.as_secs_f64(),
            "success_threshold": breaker.success_threshold,
            "call_timeout": breaker.call_timeout.as_secs_f64(),
            "scope": breaker.scope.as_str(),
        }),
    );
    document.insert(
        "max_concurrent_tools".to_string(),
        json!(config.max_concurrent_tools),
    );
    document.insert(
        "tool_execution_queue_size".to_string(),
        json!(config.tool_execution_queue_size),
    );
    document.insert(
        "admission_timeout".to_string(),
        config
            .admission_timeout
            .map_or(Value::Null, |timeout| json!(timeout.as_secs_f64())),
    );
    document.insert("strict_mode".to_string(), json!(config.strict_mode));
    document.insert(
        "debug".to_string(),
        json!({
            "enabled": config.debug.enabled,
            "trace_tool_execution": config.debug.trace_tool_execution,
        }),
    );
    Value::Object(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_then_parse_is_lossless() {
        let mut config = RunConfiguration::default();
        config.tool_timeouts.tools.insert("t".into(), Duration::from_millis(1_234));
        config
            .tool_timeouts
            .categories
            .insert(ToolCategory::Custom("vector_db".into()), Duration::from_millis(10));
        config.admission_timeout = Some(Duration::from_millis(250));
        config.circuit_breaker.scope = BreakerScope::Tool;
        config.extra.insert("max_llm_calls".into(), json!(200));

        let parsed = parse(render(&config)).expect("rendered document parses");
        assert_eq!(parsed.configuration, config);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_negative_timeout_clamps_to_fallback_in_lenient_mode() {
        let mut document = render(&RunConfiguration::default());
        document["strict_mode"] = json!(false);
        document["tool_timeouts"]["tools"] = json!({ "t": -3 });

        let parsed = parse(document).expect("lenient mode clamps");
        assert_eq!(parsed.configuration.tool_timeouts.tools["t"], FALLBACK_TIMEOUT);
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].section, "tool_timeouts.tools.t");
        assert!(parsed.warnings[0].message.contains("clamped to 10s"));
    }

    #[test]
    fn test_unknown_nested_field_is_malformed() {
        let mut document = render(&RunConfiguration::default());
        document["circuit_breaker_config"]["failure_treshold"] = json!(3);

        let err = parse(document).expect_err("typo is rejected");
        assert!(err.to_string().contains("failure_treshold"));
    }

    #[test]
    fn test_custom_retry_policy_fills_missing_fields() {
        let mut document = render(&RunConfiguration::default());
        document["retry_policies"]["vector_db"] = json!({ "max_attempts": 5 });

        let parsed = parse(document).expect("partial policy parses").configuration;
        let policy = parsed.retry_policy_for(&ToolCategory::Custom("vector_db".into()));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, RetryPolicy::default().base_delay);
    }

    #[test]
    fn test_zero_call_timeout_is_allowed() {
        let mut document = render(&RunConfiguration::default());
        document["circuit_breaker_config"]["call_timeout"] = json!(0);

        let parsed = parse(document).expect("zero disables the call timeout");
        assert_eq!(parsed.configuration.circuit_breaker.call_timeout, Duration::ZERO);
    }
}
