//! Tool abstraction consumed by the execution layer.
//!
//! A tool is anything the agent runtime can invoke with JSON arguments. The
//! execution layer never looks inside a tool; it only needs a name, an optional
//! declared [`ToolCategory`], an optional connection phase, and the call itself.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// Category a tool is dispatched under.
///
/// The string form (`generic`, `remote_procedure`, `rest_api`,
/// `local_function`, or any custom key) is the category key used in
/// configuration documents, registries and metric labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolCategory {
    /// Anything without a more specific category
    Generic,
    /// Remote procedure servers (e.g. MCP toolsets)
    RemoteProcedure,
    /// HTTP/REST APIs (e.g. OpenAPI-described tools)
    RestApi,
    /// In-process functions
    LocalFunction,
    /// Runtime-registered category
    Custom(String),
}

impl ToolCategory {
    /// All built-in categories.
    pub const BUILT_IN: [Self; 4] = [
        Self::Generic,
        Self::RemoteProcedure,
        Self::RestApi,
        Self::LocalFunction,
    ];

    /// Category key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Generic => "generic",
            Self::RemoteProcedure => "remote_procedure",
            Self::RestApi => "rest_api",
            Self::LocalFunction => "local_function",
            Self::Custom(key) => key,
        }
    }

    /// Whether tools of this category reach over the network and so have a
    /// connection-establishment phase.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::RemoteProcedure | Self::RestApi)
    }
}

impl FromStr for ToolCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "generic" => Self::Generic,
            "remote_procedure" => Self::RemoteProcedure,
            "rest_api" => Self::RestApi,
            "local_function" => Self::LocalFunction,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<&str> for ToolCategory {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl AsRef<str> for ToolCategory {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ToolCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ToolCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Ok(Self::from(key.as_str()))
    }
}

/// A capability the agent runtime invokes.
///
/// Implementations report failures as [`anyhow::Error`]; the execution layer
/// keeps that error attached as the root cause of whatever it reports.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, unique within a manager.
    fn name(&self) -> &str;

    /// Category declared by the tool's own metadata, if any.
    fn category(&self) -> Option<ToolCategory> {
        None
    }

    /// Establish the connection the call needs.
    ///
    /// Network strategies run this under the category's connection timeout
    /// before the call timeout starts. The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the downstream cannot be reached.
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoke the tool with JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails.
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

/// Boxed async tool function.
pub type ToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A [`Tool`] backed by an async closure.
///
/// ```
/// use toolguard_core::tool::{FnTool, Tool, ToolCategory};
/// use serde_json::json;
///
/// let tool = FnTool::new("echo", |args| async move { Ok(args) })
///     .with_category(ToolCategory::LocalFunction);
/// assert_eq!(tool.name(), "echo");
/// ```
#[derive(Clone)]
pub struct FnTool {
    name: String,
    category: Option<ToolCategory>,
    func: ToolFn,
}

impl FnTool {
    /// Wrap an async closure as a tool.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            category: None,
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }

    /// Declare the tool's category.
    #[must_use]
    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = Some(category);
        self
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Option<ToolCategory> {
        self.category.clone()
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.func)(args).await
    }
}
