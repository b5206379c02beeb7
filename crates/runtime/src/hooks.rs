//! Lifecycle hooks — policy, budget, memory and audit observers.
//!
//! Every hook is optional and fail-open: an error inside a hook is logged
//! and swallowed, never aborting the turn. The [`HookChain`] is the only
//! dispatcher; the loop never talks to individual hooks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hb_domain::{Message, Result, ToolCall};
use hb_model::ModelPricing;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a budget check.
#[derive(Debug, Clone, Default)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_usd: Option<f64>,
}

impl BudgetDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_usd: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            remaining_usd: Some(0.0),
        }
    }
}

/// Outcome of a tool-call policy gate.
#[derive(Debug, Clone)]
pub struct ToolGate {
    pub allowed: bool,
    pub reason: Option<String>,
    /// When set, replaces the tool input before execution.
    pub modified_input: Option<serde_json::Value>,
}

impl ToolGate {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            modified_input: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            modified_input: None,
        }
    }
}

/// Usage reported after a model call.
#[derive(Debug, Clone, Copy)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Context handed to the tool-call hooks.
#[derive(Debug, Clone)]
pub struct ToolHookContext {
    pub session_id: String,
    pub agent_id: String,
    pub org_id: String,
    pub turn: u32,
    pub call: ToolCall,
}

/// What actually happened, for `after_tool_call`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output_preview: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A side-effecting observer invoked at fixed lifecycle points.
/// Every method has a no-op default; implement only what you need.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Identifies the hook in failure logs.
    fn name(&self) -> &str;

    async fn on_session_start(&self, _sid: &str, _agent_id: &str, _org_id: &str) -> Result<()> {
        Ok(())
    }

    /// May rewrite the working messages (knowledge/memory/policy
    /// injection). Must preserve the role/content contract.
    async fn before_llm_call(
        &self,
        messages: Vec<Message>,
        _agent_id: &str,
        _sid: &str,
    ) -> Result<Vec<Message>> {
        Ok(messages)
    }

    async fn check_budget(
        &self,
        _agent_id: &str,
        _org_id: &str,
        _estimated_tokens: u64,
    ) -> Result<BudgetDecision> {
        Ok(BudgetDecision::allowed())
    }

    async fn record_llm_usage(&self, _agent_id: &str, _org_id: &str, _usage: LlmUsage) -> Result<()> {
        Ok(())
    }

    /// Pricing override for cost estimation. `None` falls through to the
    /// next hook, then the built-in table.
    async fn model_pricing(&self, _provider: &str, _model_id: &str) -> Result<Option<ModelPricing>> {
        Ok(None)
    }

    async fn before_tool_call(&self, _ctx: &ToolHookContext) -> Result<ToolGate> {
        Ok(ToolGate::allowed())
    }

    async fn after_tool_call(&self, _ctx: &ToolHookContext, _outcome: &ToolOutcome) -> Result<()> {
        Ok(())
    }

    async fn on_context_compaction(&self, _sid: &str, _agent_id: &str, _summary: &str) -> Result<()> {
        Ok(())
    }

    async fn on_session_end(&self, _sid: &str, _agent_id: &str, _org_id: &str) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HookChain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered collection of hooks with fail-open dispatch.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn on_session_start(&self, sid: &str, agent_id: &str, org_id: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_session_start(sid, agent_id, org_id).await {
                warn_hook(hook.name(), "on_session_start", &e);
            }
        }
    }

    /// Chain message transformations. A failing hook leaves the messages
    /// it received unchanged.
    pub async fn before_llm_call(
        &self,
        mut messages: Vec<Message>,
        agent_id: &str,
        sid: &str,
    ) -> Vec<Message> {
        for hook in &self.hooks {
            match hook.before_llm_call(messages.clone(), agent_id, sid).await {
                Ok(rewritten) => messages = rewritten,
                Err(e) => warn_hook(hook.name(), "before_llm_call", &e),
            }
        }
        messages
    }

    /// First denial wins; the minimum remaining budget across hooks is
    /// carried for the warning threshold.
    pub async fn check_budget(
        &self,
        agent_id: &str,
        org_id: &str,
        estimated_tokens: u64,
    ) -> BudgetDecision {
        let mut combined = BudgetDecision::allowed();
        for hook in &self.hooks {
            match hook.check_budget(agent_id, org_id, estimated_tokens).await {
                Ok(decision) => {
                    if !decision.allowed {
                        return decision;
                    }
                    combined.remaining_usd = match (combined.remaining_usd, decision.remaining_usd)
                    {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                Err(e) => warn_hook(hook.name(), "check_budget", &e),
            }
        }
        combined
    }

    pub async fn record_llm_usage(&self, agent_id: &str, org_id: &str, usage: LlmUsage) {
        for hook in &self.hooks {
            if let Err(e) = hook.record_llm_usage(agent_id, org_id, usage).await {
                warn_hook(hook.name(), "record_llm_usage", &e);
            }
        }
    }

    /// First hook returning pricing wins.
    pub async fn model_pricing(&self, provider: &str, model_id: &str) -> Option<ModelPricing> {
        for hook in &self.hooks {
            match hook.model_pricing(provider, model_id).await {
                Ok(Some(pricing)) => return Some(pricing),
                Ok(None) => {}
                Err(e) => warn_hook(hook.name(), "model_pricing", &e),
            }
        }
        None
    }

    /// First denial wins; input modifications chain in hook order.
    pub async fn before_tool_call(&self, ctx: &ToolHookContext) -> ToolGate {
        let mut current = ctx.clone();
        let mut modified_input = None;
        for hook in &self.hooks {
            match hook.before_tool_call(&current).await {
                Ok(gate) => {
                    if !gate.allowed {
                        return gate;
                    }
                    if let Some(input) = gate.modified_input {
                        current.call.input = input.clone();
                        modified_input = Some(input);
                    }
                }
                Err(e) => warn_hook(hook.name(), "before_tool_call", &e),
            }
        }
        ToolGate {
            allowed: true,
            reason: None,
            modified_input,
        }
    }

    pub async fn after_tool_call(&self, ctx: &ToolHookContext, outcome: &ToolOutcome) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_tool_call(ctx, outcome).await {
                warn_hook(hook.name(), "after_tool_call", &e);
            }
        }
    }

    pub async fn on_context_compaction(&self, sid: &str, agent_id: &str, summary: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_context_compaction(sid, agent_id, summary).await {
                warn_hook(hook.name(), "on_context_compaction", &e);
            }
        }
    }

    pub async fn on_session_end(&self, sid: &str, agent_id: &str, org_id: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_session_end(sid, agent_id, org_id).await {
                warn_hook(hook.name(), "on_session_end", &e);
            }
        }
    }
}

fn warn_hook(hook: &str, point: &str, error: &hb_domain::Error) {
    tracing::warn!(hook, point, error = %error, "hook failed; continuing");
}
