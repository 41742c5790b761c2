//! Dispatch, configuration and telemetry behaviour of the manager.

#![allow(clippy::expect_used)]

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolguard_core::config::RetryPolicy;
use toolguard_core::error::{FailureKind, ToolExecutionError};
use toolguard_core::tool::ToolCategory;
use toolguard_runtime::{
    DispatchSource, Dispatcher, ExecutionRequest, ExecutionStrategy, RetryExecutor, RuleMatcher,
    ToolExecutionManager,
};
use toolguard_testing::{test_context, ScriptedTool};

fn manager() -> ToolExecutionManager {
    ToolExecutionManager::from_document(
        test_context(),
        &json!({
            "retry_policies": {
                "default": { "max_attempts": 1 },
                "remote_procedure": { "max_attempts": 1 },
                "rest_api": { "max_attempts": 1 }
            }
        }),
    )
    .expect("valid configuration")
}

/// Strategy that records the tools it ran.
struct RecordingStrategy {
    category: ToolCategory,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionStrategy for RecordingStrategy {
    fn category(&self) -> &ToolCategory {
        &self.category
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<Value, ToolExecutionError> {
        self.seen
            .lock()
            .expect("lock")
            .push(request.tool.name().to_string());
        Ok(json!({ "via": "vector_store" }))
    }
}

#[test]
fn test_built_in_rules_pick_categories() {
    let dispatcher = Dispatcher::new();
    let resolve = |name: &str| dispatcher.resolve_category(&ScriptedTool::new(name), None);

    assert_eq!(resolve("mcp_filesystem"), (ToolCategory::RemoteProcedure, DispatchSource::Rule));
    assert_eq!(resolve("weather_api"), (ToolCategory::RestApi, DispatchSource::Rule));
    assert_eq!(resolve("openapi_petstore"), (ToolCategory::RestApi, DispatchSource::Rule));
    assert_eq!(resolve("calculator"), (ToolCategory::LocalFunction, DispatchSource::Default));
}

#[test]
fn test_dispatch_precedence() {
    let dispatcher = Dispatcher::new();
    let declared = ScriptedTool::new("mcp_calendar").with_category(ToolCategory::Generic);

    assert_eq!(
        dispatcher.resolve_category(&declared, None),
        (ToolCategory::Generic, DispatchSource::Declared)
    );

    dispatcher.set_tool_category("mcp_calendar", ToolCategory::RestApi);
    assert_eq!(
        dispatcher.resolve_category(&declared, None),
        (ToolCategory::RestApi, DispatchSource::Override)
    );

    assert_eq!(
        dispatcher.resolve_category(&declared, Some(&ToolCategory::LocalFunction)),
        (ToolCategory::LocalFunction, DispatchSource::Explicit)
    );
}

#[test]
fn test_registered_rule_takes_precedence_over_built_ins() {
    let dispatcher = Dispatcher::new();
    dispatcher.register_rule(RuleMatcher::name_contains("mcp_local"), ToolCategory::LocalFunction);

    let tool = ScriptedTool::new("mcp_local_files");
    assert_eq!(
        dispatcher.resolve_category(&tool, None),
        (ToolCategory::LocalFunction, DispatchSource::Rule)
    );
}

proptest! {
    #[test]
    fn prop_dispatch_is_deterministic(name in "[a-z_]{1,24}") {
        let dispatcher = Dispatcher::new();
        let tool = ScriptedTool::new(name);
        let context = test_context();

        let first = dispatcher.select(&tool, None, &context).expect("built-in strategy");
        for _ in 0..5 {
            let again = dispatcher.select(&tool, None, &context).expect("built-in strategy");
            prop_assert_eq!(&again.category, &first.category);
            prop_assert!(Arc::ptr_eq(&again.strategy, &first.strategy));
        }
    }

    #[test]
    fn prop_failing_operation_runs_exactly_max_attempts(max_attempts in 1u32..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let calls = AtomicU32::new(0);

        let outcome = runtime.block_on(
            RetryExecutor::new(RetryPolicy::immediate(max_attempts)).run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("permanent") }
                },
                |_, _| {},
            ),
        );

        let exhausted = outcome.expect_err("never succeeds");
        prop_assert_eq!(exhausted.attempts, max_attempts);
        prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
    }
}

#[tokio::test]
async fn test_custom_strategy_via_rule() {
    let manager = manager();
    let category = ToolCategory::Custom("vector_store".into());
    let strategy = Arc::new(RecordingStrategy {
        category: category.clone(),
        seen: Mutex::new(Vec::new()),
    });
    manager.register_strategy(category.clone(), Arc::clone(&strategy) as Arc<dyn ExecutionStrategy>);
    manager.register_dispatch_rule(RuleMatcher::name_contains("embedding"), category);
    manager.register_tool(Arc::new(ScriptedTool::new("embedding_search")));

    let value = manager
        .execute("embedding_search", None, json!({}), &test_context())
        .await
        .expect("custom strategy succeeds");

    assert_eq!(value, json!({ "via": "vector_store" }));
    assert_eq!(*strategy.seen.lock().expect("lock"), vec!["embedding_search"]);
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout_override_wins_over_category() {
    let manager = manager();
    manager
        .merge_config(&json!({
            "tool_timeouts": {
                "categories": { "local_function": 0.1 },
                "tools": { "long_report": 5.0 }
            }
        }))
        .expect("valid overlay");
    let tool = ScriptedTool::new("long_report").with_delay(Duration::from_secs(1));
    manager.register_tool(Arc::new(tool.clone()));

    manager
        .execute("long_report", None, json!({}), &test_context())
        .await
        .expect("per-tool timeout is longer than the call");

    manager
        .merge_config(&json!({ "tool_timeouts": { "tools": { "long_report": 0.5 } } }))
        .expect("valid overlay");
    let err = manager
        .execute("long_report", None, json!({}), &test_context())
        .await
        .expect_err("per-tool timeout is shorter than the call");
    assert_eq!(err.error_code().as_deref(), Some("TOOL_TIMEOUT"));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_hooks_see_every_failure() {
    let manager = manager();
    manager
        .merge_config(&json!({
            "retry_policies": {
                "rest_api": { "max_attempts": 3, "strategy": "immediate" }
            }
        }))
        .expect("valid overlay");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);
    manager.on_attempt_failed(move |failure| {
        hook_seen.lock().expect("lock").push((
            failure.attempt,
            failure.category.clone(),
            failure.context.invocation_id.clone(),
        ));
    });
    manager.register_tool(Arc::new(ScriptedTool::failing("weather_api", "503")));

    let err = manager
        .execute("weather_api", None, json!({}), &test_context())
        .await
        .expect_err("all attempts fail");
    assert_eq!(err.error_code().as_deref(), Some("TOOL_RETRIES_EXHAUSTED"));

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, category, _)| *category == ToolCategory::RestApi));
    assert_eq!(seen.iter().map(|(attempt, _, _)| *attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    let invocation = seen[0].2.clone().expect("invocation id generated");
    assert!(invocation.starts_with("inv_"));
    assert!(seen.iter().all(|(_, _, id)| id.as_deref() == Some(invocation.as_str())));
}

#[tokio::test]
async fn test_lenient_mode_clamps_and_warns() {
    let manager = manager();
    let warnings = manager
        .merge_config(&json!({
            "strict_mode": false,
            "max_concurrent_tools": 0,
            "retry_policies": { "default": { "max_attempts": 0 } }
        }))
        .expect("lenient mode accepts");

    assert_eq!(warnings.len(), 2);
    let config = manager.config();
    assert_eq!(config.max_concurrent_tools, 1);
    assert_eq!(config.retry_policy_for(&ToolCategory::Generic).max_attempts, 1);
}

#[tokio::test]
async fn test_errors_carry_diagnostics() {
    let manager = manager();
    manager.register_tool(Arc::new(ScriptedTool::failing("mcp_search", "server exited")));

    let err = manager
        .execute("mcp_search", None, json!({ "q": "x" }), &test_context())
        .await
        .expect_err("tool fails");

    let info = err.debug_info();
    assert_eq!(info.error_type, "ToolExecutionError");
    assert_eq!(info.location, "test-system -> agent:test-agent -> tool:mcp_search");
    assert_eq!(info.error_code.as_deref(), Some("TOOL_EXECUTION_FAILED"));
    assert_eq!(
        info.original_error.map(|original| original.message),
        Some("server exited".to_string())
    );
    assert!(info
        .suggested_fixes
        .iter()
        .any(|fix| fix == "Check that the remote procedure server is running"));

    match err {
        toolguard_runtime::ExecutionError::Tool(err) => {
            assert_eq!(err.kind(), FailureKind::Failed);
            assert_eq!(err.tool_type(), Some(&ToolCategory::RemoteProcedure));
        }
        other => unreachable!("unexpected error {other}"),
    }
}
