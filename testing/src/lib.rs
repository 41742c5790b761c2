//! # Toolguard Testing
//!
//! Testing utilities for the toolguard crates.
//!
//! This crate provides:
//! - [`ScriptedTool`]: a tool whose outcomes, delays and connection phase are
//!   scripted per call, and which records when each call started
//! - Context and tracing helpers
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use toolguard_core::tool::Tool;
//! use toolguard_testing::ScriptedTool;
//!
//! # tokio_test::block_on(async {
//! let tool = ScriptedTool::new("flaky_api")
//!     .then_err("503 Service Unavailable")
//!     .then_ok(json!({ "temp": 21 }));
//!
//! assert!(tool.call(json!({})).await.is_err());
//! assert_eq!(tool.call(json!({})).await.unwrap(), json!({ "temp": 21 }));
//! assert_eq!(tool.calls(), 2);
//! # });
//! ```

use toolguard_core::context::ExecutionContext;

/// Mock tools.
pub mod mocks {
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tokio::time::Instant;
    use toolguard_core::tool::{Tool, ToolCategory};

    /// What one call of a [`ScriptedTool`] does.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Return this value
        Ok(Value),
        /// Fail with this message
        Err(String),
        /// Sleep, then return `null`
        Sleep(Duration),
    }

    #[derive(Debug)]
    struct Script {
        steps: VecDeque<Step>,
        fallback: Step,
        started: Vec<Instant>,
    }

    /// A tool that plays back scripted outcomes.
    ///
    /// Each call consumes the next [`Step`]; once the script runs out every
    /// call repeats the fallback step (`Ok(null)` unless set). Clones share
    /// the script and counters.
    #[derive(Debug, Clone)]
    pub struct ScriptedTool {
        name: String,
        category: Option<ToolCategory>,
        delay: Duration,
        connect_delay: Option<Duration>,
        script: Arc<Mutex<Script>>,
        calls: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    impl ScriptedTool {
        /// Tool that succeeds with `null` until scripted otherwise.
        #[must_use]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                category: None,
                delay: Duration::ZERO,
                connect_delay: None,
                script: Arc::new(Mutex::new(Script {
                    steps: VecDeque::new(),
                    fallback: Step::Ok(Value::Null),
                    started: Vec::new(),
                })),
                calls: Arc::new(AtomicUsize::new(0)),
                connects: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Tool that fails every call with `message`.
        #[must_use]
        pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
            Self::new(name).otherwise(Step::Err(message.into()))
        }

        /// Declare a category.
        #[must_use]
        pub fn with_category(mut self, category: ToolCategory) -> Self {
            self.category = Some(category);
            self
        }

        /// Sleep this long at the start of every call.
        #[must_use]
        pub const fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Sleep this long in the connection phase.
        #[must_use]
        pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
            self.connect_delay = Some(delay);
            self
        }

        /// Append a step.
        #[must_use]
        pub fn then(self, step: Step) -> Self {
            self.lock().steps.push_back(step);
            self
        }

        /// Append a successful call.
        #[must_use]
        pub fn then_ok(self, value: Value) -> Self {
            self.then(Step::Ok(value))
        }

        /// Append a failing call.
        #[must_use]
        pub fn then_err(self, message: impl Into<String>) -> Self {
            self.then(Step::Err(message.into()))
        }

        /// Step repeated once the script runs out.
        #[must_use]
        pub fn otherwise(self, step: Step) -> Self {
            self.lock().fallback = step;
            self
        }

        /// Calls made so far.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Connection phases run so far.
        #[must_use]
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// When each call started, in call order.
        #[must_use]
        pub fn started_at(&self) -> Vec<Instant> {
            self.lock().started.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn next_step(&self) -> Step {
            let mut script = self.lock();
            script.started.push(Instant::now());
            let fallback = script.fallback.clone();
            script.steps.pop_front().unwrap_or(fallback)
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn category(&self) -> Option<ToolCategory> {
            self.category.clone()
        }

        async fn connect(&self) -> anyhow::Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn call(&self, _args: Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next_step();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match step {
                Step::Ok(value) => Ok(value),
                Step::Err(message) => Err(anyhow::anyhow!(message)),
                Step::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(Value::Null)
                }
            }
        }
    }
}

/// Test helpers.
pub mod helpers {
    use super::ExecutionContext;
    use tracing_subscriber::EnvFilter;

    /// Context for a test system with one agent.
    #[must_use]
    pub fn test_context() -> ExecutionContext {
        ExecutionContext::new("test-system").with_agent("test-agent")
    }

    /// Install a test-writer subscriber filtered by `RUST_LOG` (default
    /// `warn`). Safe to call from every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use helpers::{init_test_tracing, test_context};
pub use mocks::{ScriptedTool, Step};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use toolguard_core::tool::Tool;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let tool = ScriptedTool::failing("down", "refused").then_ok(json!(1));

        assert_eq!(tool.call(json!({})).await.ok(), Some(json!(1)));
        let err = tool.call(json!({})).await.expect_err("falls back to failure");
        assert_eq!(err.to_string(), "refused");
        assert_eq!(tool.calls(), 2);
        assert_eq!(tool.started_at().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_and_connect() {
        let tool = ScriptedTool::new("slow")
            .with_delay(Duration::from_millis(30))
            .with_connect_delay(Duration::from_millis(20));
        let started = tokio::time::Instant::now();

        tool.connect().await.expect("connects");
        tool.call(json!({})).await.expect("succeeds");

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(tool.connects(), 1);
    }

    #[test]
    fn test_context_location() {
        assert_eq!(test_context().location(), "test-system -> agent:test-agent");
    }
}
