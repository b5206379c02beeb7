//! Built-in audit hook: persists tool-call records and usage counters.
//!
//! Installed by the runtime at construction so every session gets an audit
//! trail without the embedder wiring anything.

use std::sync::Arc;

use async_trait::async_trait;

use hb_domain::Result;
use hb_store::{Store, ToolCallRecord};

use crate::hooks::{Hook, LlmUsage, ToolHookContext, ToolOutcome};

pub struct StoreAuditHook {
    store: Arc<dyn Store>,
}

impl StoreAuditHook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for StoreAuditHook {
    fn name(&self) -> &str {
        "store-audit"
    }

    async fn after_tool_call(&self, ctx: &ToolHookContext, outcome: &ToolOutcome) -> Result<()> {
        self.store
            .record_tool_call(ToolCallRecord {
                id: uuid::Uuid::new_v4().to_string(),
                tool_name: ctx.call.name.clone(),
                input: ctx.call.input.clone(),
                output_preview: outcome.output_preview.clone(),
                success: outcome.success,
                duration_ms: outcome.duration_ms,
                agent_id: ctx.agent_id.clone(),
                session_id: ctx.session_id.clone(),
                turn: ctx.turn,
                started_at: outcome.started_at,
                ended_at: outcome.ended_at,
            })
            .await
    }

    async fn record_llm_usage(&self, _agent_id: &str, org_id: &str, usage: LlmUsage) -> Result<()> {
        self.store
            .add_usage(org_id, usage.input_tokens, usage.output_tokens, usage.cost_usd)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hb_domain::ToolCall;
    use hb_store::MemStore;

    #[tokio::test]
    async fn persists_record_and_usage() {
        let store = Arc::new(MemStore::new());
        let hook = StoreAuditHook::new(store.clone());

        let ctx = ToolHookContext {
            session_id: "s1".into(),
            agent_id: "helper".into(),
            org_id: "acme".into(),
            turn: 2,
            call: ToolCall {
                id: "t1".into(),
                name: "echo".into(),
                input: serde_json::json!({"text": "ok"}),
            },
        };
        let now = Utc::now();
        hook.after_tool_call(
            &ctx,
            &ToolOutcome {
                success: true,
                output_preview: "ok".into(),
                error: None,
                started_at: now,
                ended_at: now,
                duration_ms: 3,
            },
        )
        .await
        .unwrap();

        let records = store.list_tool_calls("s1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool_name, "echo");
        assert_eq!(records[0].turn, 2);
        assert!(records[0].success);

        hook.record_llm_usage(
            "helper",
            "acme",
            LlmUsage {
                input_tokens: 100,
                output_tokens: 20,
                cost_usd: 0.005,
            },
        )
        .await
        .unwrap();
        let usage = store
            .get_usage("acme", Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage.input_tokens, 100);
    }
}
