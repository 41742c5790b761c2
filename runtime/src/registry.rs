//! Tool registry for dynamic tool management
//!
//! The registry provides:
//! - Dynamic tool registration and removal
//! - Thread-safe tool storage
//! - Lookup by name and introspection

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use toolguard_core::tool::Tool;

/// Thread-safe tool registry
///
/// Clones share the same tools.
///
/// ## Example
///
/// ```
/// use toolguard_core::tool::FnTool;
/// use toolguard_runtime::registry::ToolRegistry;
/// use std::sync::Arc;
///
/// let registry = ToolRegistry::new();
/// registry.register(Arc::new(FnTool::new("echo", |args| async move { Ok(args) })));
/// assert!(registry.get("echo").is_some());
/// ```
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its name
    ///
    /// If a tool with the same name already exists, it is replaced and this
    /// method returns `true`.
    pub fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        tools.insert(tool.name().to_string(), tool).is_some()
    }

    /// Get a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        tools.get(name).cloned()
    }

    /// Remove a tool from the registry
    ///
    /// Returns `true` if the tool was removed, `false` if it didn't exist.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        tools.remove(name).is_some()
    }

    /// Registered tool names, sorted alphabetically
    #[must_use]
    pub fn list_tools(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools
    #[must_use]
    pub fn count(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list_tools())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolguard_core::tool::FnTool;

    fn tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(FnTool::new(name, |args| async move { Ok(args) }))
    }

    #[test]
    fn test_registry_new() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_registry_register_replace() {
        let registry = ToolRegistry::new();

        assert!(!registry.register(tool("memory_search")));
        assert!(registry.register(tool("memory_search")));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_registry_list_tools_sorted() {
        let registry = ToolRegistry::new();
        registry.register(tool("web_search"));
        registry.register(tool("memory_search"));

        assert_eq!(registry.list_tools(), vec!["memory_search", "web_search"]);
    }

    #[test]
    fn test_registry_get_and_unregister() {
        let registry = ToolRegistry::new();
        registry.register(tool("memory_search"));

        assert_eq!(
            registry.get("memory_search").map(|t| t.name().to_string()),
            Some("memory_search".to_string())
        );
        assert!(registry.get("nonexistent").is_none());

        assert!(registry.unregister("memory_search"));
        assert!(!registry.unregister("memory_search"));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_clones_share_tools() {
        let registry = ToolRegistry::new();
        let clone = registry.clone();
        registry.register(tool("a"));
        assert_eq!(clone.count(), 1);
    }
}
