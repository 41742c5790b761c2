//! Strategy registry and dispatch.
//!
//! The [`Dispatcher`] maps a tool to the [`ExecutionStrategy`] it runs under.
//! The category is chosen by precedence:
//!
//! 1. an explicit category supplied by the caller
//! 2. a per-tool override set with [`Dispatcher::set_tool_category`]
//! 3. the category the tool declares in its own metadata
//! 4. the first matching [`DispatchRule`] on the tool name
//! 5. `local_function`
//!
//! Rules registered at runtime are consulted before earlier ones, so they can
//! shadow the built-in rules. Strategies, rules and overrides can all change
//! while executions are in flight; each dispatch sees a consistent view.

use crate::strategy::{ExecutionStrategy, PolicyStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use toolguard_core::context::ExecutionContext;
use toolguard_core::error::RegistryError;
use toolguard_core::tool::{Tool, ToolCategory};

/// Predicate on a tool name.
pub type NamePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How a [`DispatchRule`] matches a tool name.
#[derive(Clone)]
pub enum RuleMatcher {
    /// Name contains the lowercase substring, ignoring ASCII case of the name
    NameContains(String),
    /// Name equals the string exactly
    NameEquals(String),
    /// Arbitrary predicate
    Predicate {
        /// Shown in debug output
        description: String,
        /// The predicate
        matches: NamePredicate,
    },
}

impl RuleMatcher {
    /// Substring match, ignoring ASCII case.
    #[must_use]
    pub fn name_contains(needle: impl Into<String>) -> Self {
        Self::NameContains(needle.into().to_ascii_lowercase())
    }

    /// Exact name match.
    #[must_use]
    pub fn name_equals(name: impl Into<String>) -> Self {
        Self::NameEquals(name.into())
    }

    /// Match by predicate.
    pub fn predicate<F>(description: impl Into<String>, matches: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate {
            description: description.into(),
            matches: Arc::new(matches),
        }
    }

    /// Whether the rule applies to a tool name.
    #[must_use]
    pub fn matches(&self, tool_name: &str) -> bool {
        match self {
            Self::NameContains(needle) => tool_name.to_ascii_lowercase().contains(needle.as_str()),
            Self::NameEquals(name) => tool_name == name,
            Self::Predicate { matches, .. } => matches(tool_name),
        }
    }
}

impl fmt::Display for RuleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameContains(needle) => write!(f, "name contains \"{needle}\""),
            Self::NameEquals(name) => write!(f, "name equals \"{name}\""),
            Self::Predicate { description, .. } => write!(f, "predicate: {description}"),
        }
    }
}

impl fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleMatcher({self})")
    }
}

/// Ordered name rule mapping matching tools to a category.
#[derive(Debug, Clone)]
pub struct DispatchRule {
    /// What the rule matches
    pub matcher: RuleMatcher,
    /// Category matching tools run under
    pub category: ToolCategory,
}

impl DispatchRule {
    /// Create a rule.
    #[must_use]
    pub const fn new(matcher: RuleMatcher, category: ToolCategory) -> Self {
        Self { matcher, category }
    }

    /// Rules every [`Dispatcher::new`] starts with: `mcp` tools are remote
    /// procedures, `openapi`/`rest`/`api` tools are REST APIs.
    #[must_use]
    pub fn built_in() -> Vec<Self> {
        vec![
            Self::new(RuleMatcher::name_contains("mcp"), ToolCategory::RemoteProcedure),
            Self::new(RuleMatcher::name_contains("openapi"), ToolCategory::RestApi),
            Self::new(RuleMatcher::name_contains("rest"), ToolCategory::RestApi),
            Self::new(RuleMatcher::name_contains("api"), ToolCategory::RestApi),
        ]
    }
}

/// Which dispatch step chose the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchSource {
    /// Supplied by the caller
    Explicit,
    /// Per-tool override
    Override,
    /// Declared by the tool
    Declared,
    /// Matched a name rule
    Rule,
    /// Nothing matched
    Default,
}

/// Result of a dispatch.
#[derive(Clone)]
pub struct Dispatch {
    /// Chosen category
    pub category: ToolCategory,
    /// Which step chose it
    pub source: DispatchSource,
    /// Strategy registered for the category
    pub strategy: Arc<dyn ExecutionStrategy>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("category", &self.category)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Strategy registry plus dispatch rules and per-tool overrides.
pub struct Dispatcher {
    strategies: RwLock<HashMap<ToolCategory, Arc<dyn ExecutionStrategy>>>,
    overrides: RwLock<HashMap<String, ToolCategory>>,
    rules: RwLock<Vec<DispatchRule>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with the four built-in strategies and the built-in rules.
    #[must_use]
    pub fn new() -> Self {
        let dispatcher = Self::empty();
        for strategy in [
            PolicyStrategy::generic(),
            PolicyStrategy::remote_procedure(),
            PolicyStrategy::rest_api(),
            PolicyStrategy::local_function(),
        ] {
            let category = strategy.category().clone();
            dispatcher.register_strategy(category, Arc::new(strategy));
        }
        *dispatcher.rules.write().unwrap_or_else(PoisonError::into_inner) = DispatchRule::built_in();
        dispatcher
    }

    /// Dispatcher with no strategies and no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Register or replace the strategy for a category. Returns the strategy
    /// it replaced.
    pub fn register_strategy(
        &self,
        category: ToolCategory,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Option<Arc<dyn ExecutionStrategy>> {
        tracing::debug!(category = %category, "Registering execution strategy");
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, strategy)
    }

    /// Add a rule ahead of every existing rule.
    pub fn register_rule(&self, matcher: RuleMatcher, category: ToolCategory) {
        tracing::debug!(rule = %matcher, category = %category, "Registering dispatch rule");
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, DispatchRule::new(matcher, category));
    }

    /// Pin a tool to a category, ahead of its declared category and the rules.
    pub fn set_tool_category(&self, tool_name: impl Into<String>, category: ToolCategory) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_name.into(), category);
    }

    /// Remove a per-tool override. Returns the category it pinned.
    pub fn clear_tool_category(&self, tool_name: &str) -> Option<ToolCategory> {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool_name)
    }

    /// Category a tool runs under, and which step chose it.
    #[must_use]
    pub fn resolve_category(&self, tool: &dyn Tool, explicit: Option<&ToolCategory>) -> (ToolCategory, DispatchSource) {
        if let Some(category) = explicit {
            return (category.clone(), DispatchSource::Explicit);
        }
        let name = tool.name();
        if let Some(category) = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return (category.clone(), DispatchSource::Override);
        }
        if let Some(category) = tool.category() {
            return (category, DispatchSource::Declared);
        }
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| rule.matcher.matches(name))
            .map_or((ToolCategory::LocalFunction, DispatchSource::Default), |rule| {
                (rule.category.clone(), DispatchSource::Rule)
            })
    }

    /// Choose the strategy for a tool.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if no strategy is registered for the chosen
    /// category.
    pub fn select(
        &self,
        tool: &dyn Tool,
        explicit: Option<&ToolCategory>,
        context: &ExecutionContext,
    ) -> Result<Dispatch, RegistryError> {
        let (category, source) = self.resolve_category(tool, explicit);
        let strategy = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
            .ok_or_else(|| RegistryError::unknown_category(&category, context.clone()))?;
        tracing::debug!(tool = tool.name(), category = %category, source = ?source, "Dispatched tool");
        Ok(Dispatch {
            category,
            source,
            strategy,
        })
    }

    /// Registered strategies by category key.
    #[must_use]
    pub fn strategies(&self) -> BTreeMap<String, Arc<dyn ExecutionStrategy>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(category, strategy)| (category.to_string(), Arc::clone(strategy)))
            .collect()
    }

    /// Rules in the order they are consulted.
    #[must_use]
    pub fn rules(&self) -> Vec<DispatchRule> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Per-tool overrides.
    #[must_use]
    pub fn overrides(&self) -> BTreeMap<String, ToolCategory> {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, category)| (name.clone(), category.clone()))
            .collect()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategies", &self.strategies().keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides())
            .field("rules", &self.rules())
            .finish()
    }
}
