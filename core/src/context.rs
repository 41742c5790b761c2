//! Execution context threaded through tool invocations.
//!
//! An [`ExecutionContext`] describes *where* an execution happens: which
//! system, which agent, which tool, and which invocation/session/user. It is an
//! immutable value. Every `with_*` method returns a new copy and leaves the
//! original untouched, so one context can be fanned out to many concurrent
//! tool calls without coordination.
//!
//! # Example
//!
//! ```
//! use toolguard_core::context::ExecutionContext;
//!
//! let root = ExecutionContext::new("customer-support");
//! let tool_ctx = root.with_agent("triage").with_tool("lookup_order");
//!
//! assert_eq!(tool_ctx.location(), "customer-support -> agent:triage -> tool:lookup_order");
//! assert_eq!(root.location(), "customer-support");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Immutable location descriptor for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Name of the agent system being executed
    pub system_name: String,
    /// Path of the configuration document the system was loaded from
    pub config_path: Option<PathBuf>,
    /// Agent currently executing
    pub current_agent: Option<String>,
    /// Tool currently executing
    pub current_tool: Option<String>,
    /// Invocation id for tracing
    pub invocation_id: Option<String>,
    /// Session id
    pub session_id: Option<String>,
    /// User id
    pub user_id: Option<String>,
    /// Free-form additional context
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ExecutionContext {
    /// Create a root context for a system.
    #[must_use]
    pub fn new(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            config_path: None,
            current_agent: None,
            current_tool: None,
            invocation_id: None,
            session_id: None,
            user_id: None,
            extra: BTreeMap::new(),
        }
    }

    /// Copy with the configuration path set.
    #[must_use]
    pub fn with_config_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
            ..self.clone()
        }
    }

    /// Copy with the given agent. The current tool is cleared, since a tool
    /// always belongs to the agent that invoked it.
    #[must_use]
    pub fn with_agent(&self, agent_name: impl Into<String>) -> Self {
        Self {
            current_agent: Some(agent_name.into()),
            current_tool: None,
            ..self.clone()
        }
    }

    /// Copy with the given tool.
    #[must_use]
    pub fn with_tool(&self, tool_name: impl Into<String>) -> Self {
        Self {
            current_tool: Some(tool_name.into()),
            ..self.clone()
        }
    }

    /// Copy with invocation, session and user ids.
    #[must_use]
    pub fn with_invocation(
        &self,
        invocation_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            session_id: Some(session_id.into()),
            user_id: Some(user_id.into()),
            ..self.clone()
        }
    }

    /// Copy with only the invocation id replaced.
    #[must_use]
    pub fn with_invocation_id(&self, invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            ..self.clone()
        }
    }

    /// Copy with one additional context entry.
    #[must_use]
    pub fn with_extra(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut extra = self.extra.clone();
        extra.insert(key.into(), value.into());
        Self {
            extra,
            ..self.clone()
        }
    }

    /// Human-readable location: `system -> agent:X -> tool:Y`.
    #[must_use]
    pub fn location(&self) -> String {
        let mut parts = vec![self.system_name.clone()];
        if let Some(agent) = &self.current_agent {
            parts.push(format!("agent:{agent}"));
        }
        if let Some(tool) = &self.current_tool {
            parts.push(format!("tool:{tool}"));
        }
        parts.join(" -> ")
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_string() {
        let ctx = ExecutionContext::new("pipeline");
        assert_eq!(ctx.location(), "pipeline");

        let ctx = ctx.with_agent("processor");
        assert_eq!(ctx.location(), "pipeline -> agent:processor");

        let ctx = ctx.with_tool("extract");
        assert_eq!(ctx.location(), "pipeline -> agent:processor -> tool:extract");
    }

    #[test]
    fn test_tool_without_agent() {
        let ctx = ExecutionContext::new("pipeline").with_tool("extract");
        assert_eq!(ctx.location(), "pipeline -> tool:extract");
    }

    #[test]
    fn test_derivation_does_not_mutate_original() {
        let root = ExecutionContext::new("sys").with_extra("region", "eu");
        let derived = root
            .with_agent("a")
            .with_tool("t")
            .with_invocation("inv_1", "sess_1", "user_1")
            .with_extra("attempt", 2);

        assert_eq!(root.current_agent, None);
        assert_eq!(root.current_tool, None);
        assert_eq!(root.invocation_id, None);
        assert_eq!(root.extra.len(), 1);

        assert_eq!(derived.invocation_id.as_deref(), Some("inv_1"));
        assert_eq!(derived.session_id.as_deref(), Some("sess_1"));
        assert_eq!(derived.user_id.as_deref(), Some("user_1"));
        assert_eq!(derived.extra.len(), 2);
    }

    #[test]
    fn test_with_agent_clears_tool() {
        let ctx = ExecutionContext::new("sys").with_agent("a").with_tool("t");
        let switched = ctx.with_agent("b");

        assert_eq!(switched.current_agent.as_deref(), Some("b"));
        assert_eq!(switched.current_tool, None);
    }

    #[test]
    fn test_with_invocation_id_keeps_session() {
        let ctx = ExecutionContext::new("sys")
            .with_invocation("inv_1", "sess", "user")
            .with_invocation_id("inv_2");

        assert_eq!(ctx.invocation_id.as_deref(), Some("inv_2"));
        assert_eq!(ctx.session_id.as_deref(), Some("sess"));
    }

    #[test]
    fn test_display_matches_location() {
        let ctx = ExecutionContext::new("sys")
            .with_config_path("/etc/agents.yaml")
            .with_tool("t");
        assert_eq!(ctx.to_string(), "sys -> tool:t");
    }
}
