//! Timeout-bounded tool execution.
//!
//! Every failure mode — tool error, timeout, cancellation, panic, unknown
//! name — becomes a structured error result; nothing propagates to the
//! loop. The model-facing rendering is capped at a provider-safe size.

use std::sync::Arc;
use std::time::Duration;

use hb_domain::ToolCall;

use crate::registry::ToolRegistry;
use crate::tool::{ToolBlock, ToolContext, ToolResult};

/// Provider-safe cap on a single tool_result body.
const MAX_CONTENT_BYTES: usize = 50 * 1024;

/// A completed execution: the structured result plus the stringified form
/// fed back to the model.
#[derive(Debug, Clone)]
pub struct ExecutedTool {
    pub result: ToolResult,
    pub content: String,
}

pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Execute one call. Never returns an error; the result's `success`
    /// flag and `error` field carry every failure mode.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> ExecutedTool {
        let Some(tool) = registry.get(&call.name) else {
            return finish(ToolResult::err(format!("Unknown tool: {}", call.name)));
        };

        let result = self.run_bounded(tool, call, ctx).await;
        finish(result)
    }

    async fn run_bounded(
        &self,
        tool: Arc<dyn crate::tool::Tool>,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> ToolResult {
        let call_id = call.id.clone();
        let input = call.input.clone();
        let task_ctx = ctx.clone();
        // Spawned so a panicking tool is isolated from the session loop.
        let task = tokio::spawn(async move {
            tool.execute(&call_id, input, &task_ctx).await
        });
        let abort = task.abort_handle();

        let bounded = tokio::time::timeout(self.timeout, task);
        tokio::select! {
            outcome = bounded => match outcome {
                Err(_) => {
                    abort.abort();
                    tracing::warn!(
                        tool_name = %call.name,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "tool execution timed out"
                    );
                    ToolResult::err(format!(
                        "timeout: tool '{}' exceeded {}ms",
                        call.name,
                        self.timeout.as_millis()
                    ))
                }
                Ok(Err(join_err)) => {
                    tracing::warn!(tool_name = %call.name, error = %join_err, "tool panicked");
                    ToolResult::err(format!("tool '{}' panicked: {join_err}", call.name))
                }
                Ok(Ok(Err(e))) => ToolResult::err(e.to_string()),
                Ok(Ok(Ok(result))) => result,
            },
            _ = cancelled(&ctx.cancel) => {
                abort.abort();
                ToolResult::err(format!("cancelled: tool '{}' aborted", call.name))
            }
        }
    }
}

async fn cancelled(token: &hb_domain::CancelToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn finish(result: ToolResult) -> ExecutedTool {
    let content = render_content(&result);
    ExecutedTool { result, content }
}

/// Stringify the result for the model: text blocks joined by newlines,
/// image blocks replaced by a marker, capped at [`MAX_CONTENT_BYTES`].
fn render_content(result: &ToolResult) -> String {
    let joined = result
        .content
        .iter()
        .map(|b| match b {
            ToolBlock::Text { text } => text.clone(),
            ToolBlock::Image { media_type, .. } => {
                format!("[image: {}]", media_type.as_deref().unwrap_or("unknown"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    truncate_str(&joined, MAX_CONTENT_BYTES)
}

/// Truncate at a char boundary, appending an ellipsis marker when cut.
fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::tool::{RiskLevel, Tool};
    use hb_domain::{CancelToken, Error, Result};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn label(&self) -> &str {
            "Echo back the given text"
        }
        fn category(&self) -> &str {
            "debug"
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Low
        }
        fn parameters(&self) -> serde_json::Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(
            &self,
            _call_id: &str,
            input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult> {
            Ok(ToolResult::ok(
                input["text"].as_str().unwrap_or_default().to_owned(),
            ))
        }
    }

    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }
        fn label(&self) -> &str {
            "Sleep for a while"
        }
        fn category(&self) -> &str {
            "debug"
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Low
        }
        fn parameters(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolResult::ok("slept"))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn label(&self) -> &str {
            "Always fails"
        }
        fn category(&self) -> &str {
            "debug"
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Low
        }
        fn parameters(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult> {
            Err(Error::ToolFailed("disk on fire".into()))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s1".into(),
            agent_id: "helper".into(),
            turn: 1,
            cancel: CancelToken::new(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg.register(Arc::new(SleepTool));
        reg.register(Arc::new(FailTool));
        reg
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn echo_succeeds() {
        let exec = ToolExecutor::new(1000);
        let out = exec
            .execute(&registry(), &call("echo", json!({"text": "ok"})), &ctx())
            .await;
        assert!(out.result.success);
        assert_eq!(out.content, "ok");
    }

    #[tokio::test]
    async fn unknown_tool_is_synthetic_error() {
        let exec = ToolExecutor::new(1000);
        let out = exec
            .execute(&registry(), &call("foobar", json!({})), &ctx())
            .await;
        assert!(!out.result.success);
        assert!(out.content.contains("Unknown tool: foobar"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let exec = ToolExecutor::new(50);
        let out = exec
            .execute(&registry(), &call("sleep", json!({})), &ctx())
            .await;
        assert!(!out.result.success);
        assert!(out.result.error.as_deref().unwrap().starts_with("timeout"));
    }

    #[tokio::test]
    async fn tool_error_becomes_result() {
        let exec = ToolExecutor::new(1000);
        let out = exec
            .execute(&registry(), &call("fail", json!({})), &ctx())
            .await;
        assert!(!out.result.success);
        assert!(out.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn cancellation_aborts_execution() {
        let exec = ToolExecutor::new(60_000);
        let ctx = ctx();
        ctx.cancel.cancel();
        let out = exec
            .execute(&registry(), &call("sleep", json!({})), &ctx)
            .await;
        assert!(!out.result.success);
        assert!(out.result.error.as_deref().unwrap().starts_with("cancelled"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // 'é' is 2 bytes; cutting at byte 1 must back up.
        assert_eq!(truncate_str("héllo", 1), "h...");
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[tokio::test]
    async fn oversized_output_is_capped() {
        struct BigTool;
        #[async_trait]
        impl Tool for BigTool {
            fn name(&self) -> &str {
                "big"
            }
            fn label(&self) -> &str {
                "Produces a huge output"
            }
            fn category(&self) -> &str {
                "debug"
            }
            fn risk(&self) -> RiskLevel {
                RiskLevel::Low
            }
            fn parameters(&self) -> serde_json::Value {
                json!({ "type": "object" })
            }
            async fn execute(
                &self,
                _call_id: &str,
                _input: serde_json::Value,
                _ctx: &ToolContext,
            ) -> Result<ToolResult> {
                Ok(ToolResult::ok("x".repeat(200 * 1024)))
            }
        }

        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(BigTool));
        let exec = ToolExecutor::new(1000);
        let out = exec.execute(&reg, &call("big", json!({})), &ctx()).await;
        assert!(out.result.success);
        assert!(out.content.len() <= MAX_CONTENT_BYTES + 3);
    }
}
