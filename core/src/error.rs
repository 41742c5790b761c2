//! Contextual, diagnosable errors.
//!
//! Every error raised by the execution layer carries an [`ErrorDetails`]
//! block: the message, a snapshot of the [`ExecutionContext`] it happened in,
//! an error code, suggested fixes, and the original underlying error when
//! there is one. The original error is exposed through
//! [`std::error::Error::source`] so cause chains stay intact.
//!
//! # Taxonomy
//!
//! - [`ToolExecutionError`]: timeout, retries exhausted, circuit open, admission
//! - [`ConfigurationError`]: invalid policy values at load time
//! - [`RegistryError`]: unknown tool or category

use crate::context::ExecutionContext;
use crate::tool::ToolCategory;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// System name used by errors raised outside any execution (e.g. while
/// parsing a configuration document) until a caller attaches its context.
pub const UNSCOPED_SYSTEM: &str = "<unscoped>";

/// The underlying error an execution error wraps.
#[derive(Debug)]
pub struct OriginalError {
    type_name: Cow<'static, str>,
    error: anyhow::Error,
}

impl OriginalError {
    /// Wrap a typed error, remembering its type name.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            type_name: Cow::Borrowed(std::any::type_name::<E>()),
            error: anyhow::Error::new(error),
        }
    }

    /// Wrap an opaque tool failure.
    #[must_use]
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self {
            type_name: Cow::Borrowed("anyhow::Error"),
            error,
        }
    }

    /// Type name of the wrapped error.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The wrapped error.
    #[must_use]
    pub const fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Messages of the error and each of its causes, outermost first.
    #[must_use]
    pub fn chain(&self) -> Vec<String> {
        self.error.chain().map(ToString::to_string).collect()
    }

    fn info(&self) -> OriginalErrorInfo {
        OriginalErrorInfo {
            error_type: self.type_name.to_string(),
            message: self.error.to_string(),
            causes: self.chain().into_iter().skip(1).collect(),
            trace: format!("{:?}", self.error),
        }
    }
}

/// Fields shared by every contextual error.
#[derive(Debug)]
pub struct ErrorDetails {
    /// What went wrong
    pub message: String,
    /// Where it went wrong
    pub context: ExecutionContext,
    /// Stable code for categorisation
    pub error_code: Option<String>,
    /// Remediations, most specific last
    pub suggested_fixes: Vec<String>,
    /// Root cause, if any
    pub original: Option<OriginalError>,
}

impl ErrorDetails {
    /// Details with a message and context only.
    #[must_use]
    pub fn new(message: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            message: message.into(),
            context,
            error_code: None,
            suggested_fixes: Vec::new(),
            original: None,
        }
    }

    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.original
            .as_ref()
            .map(|original| -> &(dyn std::error::Error + 'static) { original.error.as_ref() })
    }
}

/// Structured snapshot of an error for logs and debug endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    /// Error type name
    pub error_type: &'static str,
    /// Fully rendered message
    pub message: String,
    /// `system -> agent:X -> tool:Y`
    pub location: String,
    /// Full context snapshot
    pub context: ExecutionContext,
    /// Error code, if any
    pub error_code: Option<String>,
    /// Suggested fixes
    pub suggested_fixes: Vec<String>,
    /// Root cause, if any
    pub original_error: Option<OriginalErrorInfo>,
}

/// Root-cause part of a [`DebugInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct OriginalErrorInfo {
    /// Type name recorded when the error was wrapped
    pub error_type: String,
    /// Top-level message
    pub message: String,
    /// Messages of nested causes
    pub causes: Vec<String>,
    /// Debug rendering, including a backtrace when one was captured
    pub trace: String,
}

/// Errors that carry [`ErrorDetails`].
pub trait Diagnosable: std::error::Error {
    /// Short type name used in debug output.
    fn error_type(&self) -> &'static str;

    /// Shared details.
    fn details(&self) -> &ErrorDetails;

    /// Message enriched with type-specific information.
    fn headline(&self) -> String {
        self.details().message.clone()
    }

    /// Structured snapshot: message, location, context, root cause, code, fixes.
    fn debug_info(&self) -> DebugInfo {
        let details = self.details();
        DebugInfo {
            error_type: self.error_type(),
            message: self.to_string(),
            location: details.context.location(),
            context: details.context.clone(),
            error_code: details.error_code.clone(),
            suggested_fixes: details.suggested_fixes.clone(),
            original_error: details.original.as_ref().map(OriginalError::info),
        }
    }
}

fn render(f: &mut fmt::Formatter<'_>, headline: &str, details: &ErrorDetails) -> fmt::Result {
    write!(f, "[{}] {headline}", details.context.location())?;
    if let Some(original) = &details.original {
        write!(f, "\n  Caused by: {}: {}", original.type_name, original.error)?;
    }
    if let Some(code) = &details.error_code {
        write!(f, "\n  Error Code: {code}")?;
    }
    if !details.suggested_fixes.is_empty() {
        write!(f, "\n  Suggested fixes:")?;
        for (i, fix) in details.suggested_fixes.iter().enumerate() {
            write!(f, "\n    {}. {fix}", i + 1)?;
        }
    }
    Ok(())
}

/// Why a tool execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A single attempt exceeded its timeout
    Timeout,
    /// The connection phase exceeded the connection timeout
    ConnectionTimeout,
    /// The tool returned an error
    Failed,
    /// Every attempt of a multi-attempt policy failed
    RetriesExhausted,
    /// The circuit breaker rejected the call
    CircuitOpen,
    /// No admission slot became free in time
    AdmissionTimeout,
    /// Too many executions were already waiting for a slot
    QueueFull,
}

impl FailureKind {
    /// Stable error code.
    #[must_use]
    pub const fn error_code(self) -> &'static str {
        match self {
            Self::Timeout => "TOOL_TIMEOUT",
            Self::ConnectionTimeout => "TOOL_CONNECTION_TIMEOUT",
            Self::Failed => "TOOL_EXECUTION_FAILED",
            Self::RetriesExhausted => "TOOL_RETRIES_EXHAUSTED",
            Self::CircuitOpen => "CIRCUIT_BREAKER_OPEN",
            Self::AdmissionTimeout => "TOOL_ADMISSION_TIMEOUT",
            Self::QueueFull => "TOOL_QUEUE_FULL",
        }
    }

    /// Static remediation lookup.
    #[must_use]
    pub const fn remediation(self) -> &'static [&'static str] {
        match self {
            Self::Timeout => &[
                "Increase the tool timeout in configuration",
                "Check if the external service is responsive",
                "Check network connectivity to the tool backend",
            ],
            Self::ConnectionTimeout => &[
                "Increase the connection timeout for this tool category",
                "Check that the tool server is running and reachable",
            ],
            Self::Failed => &[
                "Check the tool implementation and its logs",
                "Verify tool parameters and types",
            ],
            Self::RetriesExhausted => &[
                "Check if the external service is available",
                "Increase retry attempts or timeout values",
                "Verify tool configuration and parameters",
            ],
            Self::CircuitOpen => &[
                "Check the health of the downstream service",
                "Wait for the circuit breaker recovery timeout to elapse",
            ],
            Self::AdmissionTimeout => &[
                "Increase max_concurrent_tools",
                "Increase admission_timeout or reduce concurrent tool load",
            ],
            Self::QueueFull => &[
                "Increase tool_execution_queue_size",
                "Reduce the number of concurrent tool calls",
            ],
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_code())
    }
}

#[derive(Debug)]
struct ToolErrorInner {
    details: ErrorDetails,
    kind: FailureKind,
    tool_type: Option<ToolCategory>,
    elapsed: Option<Duration>,
    timeout_used: Option<Duration>,
    attempts: u32,
}

/// A tool execution failed after local retry and breaker logic ran out.
///
/// ```
/// use toolguard_core::context::ExecutionContext;
/// use toolguard_core::error::{Diagnosable, FailureKind, ToolExecutionError};
/// use std::time::Duration;
///
/// let err = ToolExecutionError::new(
///     FailureKind::Timeout,
///     "Tool execution timed out",
///     ExecutionContext::new("sys").with_tool("fetch"),
/// )
/// .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(err.error_code(), "TOOL_TIMEOUT");
/// assert!(err.to_string().starts_with("[sys -> tool:fetch] Tool execution timed out"));
/// ```
#[derive(Debug)]
pub struct ToolExecutionError {
    inner: Box<ToolErrorInner>,
}

impl ToolExecutionError {
    /// Create an error of the given kind. The error code and the kind's
    /// remediations are filled in.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>, context: ExecutionContext) -> Self {
        let mut details = ErrorDetails::new(message, context);
        details.error_code = Some(kind.error_code().to_string());
        details.suggested_fixes = kind.remediation().iter().map(ToString::to_string).collect();
        Self {
            inner: Box::new(ToolErrorInner {
                details,
                kind,
                tool_type: None,
                elapsed: None,
                timeout_used: None,
                attempts: 0,
            }),
        }
    }

    /// Set the tool category.
    #[must_use]
    pub fn with_tool_type(mut self, tool_type: ToolCategory) -> Self {
        self.inner.tool_type = Some(tool_type);
        self
    }

    /// Set how long the execution ran.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.inner.elapsed = Some(elapsed);
        self
    }

    /// Set the timeout that applied.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inner.timeout_used = Some(timeout);
        self
    }

    /// Set how many attempts ran.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.inner.attempts = attempts;
        self
    }

    /// Attach the root cause.
    #[must_use]
    pub fn with_source(mut self, original: OriginalError) -> Self {
        self.inner.details.original = Some(original);
        self
    }

    /// Append remediations.
    #[must_use]
    pub fn with_fixes<I, S>(mut self, fixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_suggested_fixes(fixes);
        self
    }

    /// Append remediations in place, skipping ones already present.
    pub fn add_suggested_fixes<I, S>(&mut self, fixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let existing = &mut self.inner.details.suggested_fixes;
        for fix in fixes {
            let fix = fix.into();
            if !existing.contains(&fix) {
                existing.push(fix);
            }
        }
    }

    /// Replace the context snapshot.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.inner.details.context = context;
        self
    }

    /// Failure kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.inner.kind
    }

    /// Error code string.
    #[must_use]
    pub fn error_code(&self) -> &str {
        self.inner.kind.error_code()
    }

    /// Base message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.inner.details.message
    }

    /// Context snapshot.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.details.context
    }

    /// Tool category.
    #[must_use]
    pub fn tool_type(&self) -> Option<&ToolCategory> {
        self.inner.tool_type.as_ref()
    }

    /// Elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.elapsed
    }

    /// Timeout that applied.
    #[must_use]
    pub fn timeout_used(&self) -> Option<Duration> {
        self.inner.timeout_used
    }

    /// Attempts made. Zero when the tool was never called.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts
    }

    /// Suggested fixes.
    #[must_use]
    pub fn suggested_fixes(&self) -> &[String] {
        &self.inner.details.suggested_fixes
    }

    /// Root cause.
    #[must_use]
    pub fn original_error(&self) -> Option<&OriginalError> {
        self.inner.details.original.as_ref()
    }
}

impl Diagnosable for ToolExecutionError {
    fn error_type(&self) -> &'static str {
        "ToolExecutionError"
    }

    fn details(&self) -> &ErrorDetails {
        &self.inner.details
    }

    fn headline(&self) -> String {
        let mut headline = self.inner.details.message.clone();
        if let Some(tool_type) = &self.inner.tool_type {
            headline.push_str(&format!(" (tool_type: {tool_type})"));
        }
        if let (Some(elapsed), Some(timeout)) = (self.inner.elapsed, self.inner.timeout_used) {
            headline.push_str(&format!(
                " (executed for {:.1}s, timeout: {:.1}s)",
                elapsed.as_secs_f64(),
                timeout.as_secs_f64()
            ));
        }
        headline
    }
}

impl fmt::Display for ToolExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, &self.headline(), &self.inner.details)
    }
}

impl std::error::Error for ToolExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.details.source()
    }
}

#[derive(Debug)]
struct ConfigErrorInner {
    details: ErrorDetails,
    section: Option<String>,
    issues: Vec<String>,
}

/// A configuration document holds invalid values.
#[derive(Debug)]
pub struct ConfigurationError {
    inner: Box<ConfigErrorInner>,
}

impl ConfigurationError {
    /// Error for a whole document, listing every issue found.
    #[must_use]
    pub fn invalid(section: Option<String>, issues: Vec<String>) -> Self {
        let message = match issues.as_slice() {
            [single] => format!("Invalid configuration: {single}"),
            many => format!("Invalid configuration ({} issues): {}", many.len(), many.join("; ")),
        };
        let mut details = ErrorDetails::new(message, ExecutionContext::new(UNSCOPED_SYSTEM));
        details.error_code = Some("CONFIGURATION_INVALID".to_string());
        details.suggested_fixes = vec![
            "Check the configuration values against their documented ranges".to_string(),
            "Set strict_mode: false to clamp invalid values with a warning".to_string(),
        ];
        Self {
            inner: Box::new(ConfigErrorInner {
                details,
                section,
                issues,
            }),
        }
    }

    /// Error for a document that does not have the expected shape.
    #[must_use]
    pub fn malformed(section: Option<String>, error: serde_json::Error) -> Self {
        let mut details = ErrorDetails::new(
            format!("Malformed configuration document: {error}"),
            ExecutionContext::new(UNSCOPED_SYSTEM),
        );
        details.error_code = Some("CONFIGURATION_MALFORMED".to_string());
        details.suggested_fixes = vec![
            "Check the document structure and value types".to_string(),
        ];
        details.original = Some(OriginalError::new(error));
        Self {
            inner: Box::new(ConfigErrorInner {
                details,
                section,
                issues: Vec::new(),
            }),
        }
    }

    /// Attach the context the configuration was loaded in.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.inner.details.context = context;
        self
    }

    /// Section of the document at fault, if known.
    #[must_use]
    pub fn section(&self) -> Option<&str> {
        self.inner.section.as_deref()
    }

    /// Every validation issue found.
    #[must_use]
    pub fn issues(&self) -> &[String] {
        &self.inner.issues
    }
}

impl Diagnosable for ConfigurationError {
    fn error_type(&self) -> &'static str {
        "ConfigurationError"
    }

    fn details(&self) -> &ErrorDetails {
        &self.inner.details
    }

    fn headline(&self) -> String {
        let mut headline = self.inner.details.message.clone();
        if let Some(section) = &self.inner.section {
            headline.push_str(&format!(" (section: {section})"));
        }
        if let Some(path) = &self.inner.details.context.config_path {
            headline.push_str(&format!(" (file: {})", path.display()));
        }
        headline
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, &self.headline(), &self.inner.details)
    }
}

impl std::error::Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.details.source()
    }
}

/// Which registry a lookup missed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    /// Tool registry
    Tool,
    /// Strategy registry (keyed by category)
    Strategy,
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool => f.write_str("tool"),
            Self::Strategy => f.write_str("strategy"),
        }
    }
}

#[derive(Debug)]
struct RegistryErrorInner {
    details: ErrorDetails,
    registry: RegistryKind,
    missing_item: String,
}

/// A tool or category is not registered.
#[derive(Debug)]
pub struct RegistryError {
    inner: Box<RegistryErrorInner>,
}

impl RegistryError {
    /// No tool with this name is registered.
    #[must_use]
    pub fn unknown_tool(name: &str, context: ExecutionContext) -> Self {
        Self::missing(
            RegistryKind::Tool,
            name,
            format!("Tool '{name}' not found in registry"),
            context,
            &[
                "Register the tool with the manager before executing it",
                "Check tool name spelling and case sensitivity",
            ],
        )
    }

    /// No strategy is registered for this category.
    #[must_use]
    pub fn unknown_category(category: &ToolCategory, context: ExecutionContext) -> Self {
        Self::missing(
            RegistryKind::Strategy,
            category.as_str(),
            format!("No execution strategy registered for category '{category}'"),
            context,
            &[
                "Register a strategy for this category",
                "Check dispatch rules and per-tool category overrides",
            ],
        )
    }

    fn missing(
        registry: RegistryKind,
        item: &str,
        message: String,
        context: ExecutionContext,
        fixes: &[&str],
    ) -> Self {
        let mut details = ErrorDetails::new(message, context);
        details.error_code = Some(match registry {
            RegistryKind::Tool => "REGISTRY_TOOL_NOT_FOUND".to_string(),
            RegistryKind::Strategy => "REGISTRY_STRATEGY_NOT_FOUND".to_string(),
        });
        details.suggested_fixes = fixes.iter().map(ToString::to_string).collect();
        Self {
            inner: Box::new(RegistryErrorInner {
                details,
                registry,
                missing_item: item.to_string(),
            }),
        }
    }

    /// Registry the lookup missed in.
    #[must_use]
    pub fn registry(&self) -> RegistryKind {
        self.inner.registry
    }

    /// Name that was looked up.
    #[must_use]
    pub fn missing_item(&self) -> &str {
        &self.inner.missing_item
    }
}

impl Diagnosable for RegistryError {
    fn error_type(&self) -> &'static str {
        "RegistryError"
    }

    fn details(&self) -> &ErrorDetails {
        &self.inner.details
    }

    fn headline(&self) -> String {
        format!(
            "{} ({} registry: {})",
            self.inner.details.message, self.inner.registry, self.inner.missing_item
        )
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, &self.headline(), &self.inner.details)
    }
}

impl std::error::Error for RegistryError {}
