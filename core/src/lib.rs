//! # Toolguard Core
//!
//! Core types for resilient tool execution in agent runtimes.
//!
//! This crate holds everything the execution layer shares but that carries no
//! runtime machinery of its own:
//!
//! - [`context`]: the immutable [`ExecutionContext`] describing where an
//!   execution happens
//! - [`error`]: contextual errors with codes, suggested fixes and root causes
//! - [`tool`]: the [`Tool`] trait and [`ToolCategory`]
//! - [`config`]: the layered [`RunConfiguration`] with timeout, retry and
//!   circuit breaker policies
//!
//! The retry executor, circuit breaker, strategies and the execution manager
//! live in `toolguard-runtime`.

pub mod config;
pub mod context;
pub mod error;
pub mod tool;

pub use config::{LoadedConfiguration, RetryPolicy, RetryStrategy, RunConfiguration};
pub use context::ExecutionContext;
pub use error::{
    ConfigurationError, Diagnosable, FailureKind, OriginalError, RegistryError, ToolExecutionError,
};
pub use tool::{FnTool, Tool, ToolCategory};
