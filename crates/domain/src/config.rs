//! Runtime and per-agent configuration.
//!
//! Every knob has a serde default so a minimal TOML file (or
//! `RuntimeConfig::default()`) yields a working runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A (provider, model) pair, e.g. `("anthropic", "claude-sonnet-4")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }
}

/// Retry budget for model calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total wall-clock budget across all attempts and waits.
    #[serde(default = "default_max_total_ms")]
    pub max_total_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_total_ms: default_max_total_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_total_ms() -> u64 {
    120_000
}

/// Context-window compaction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compact when estimated tokens exceed this fraction of the window.
    #[serde(default = "default_compaction_threshold")]
    pub threshold: f32,
    /// Non-system messages preserved verbatim at the tail.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Upper bound on the synthetic digest body.
    #[serde(default = "default_digest_max_bytes")]
    pub digest_max_bytes: usize,
    /// Characters contributed per summarised message.
    #[serde(default = "default_per_message_chars")]
    pub per_message_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: default_compaction_threshold(),
            keep_recent: default_keep_recent(),
            digest_max_bytes: default_digest_max_bytes(),
            per_message_chars: default_per_message_chars(),
        }
    }
}

fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_keep_recent() -> usize {
    10
}
fn default_digest_max_bytes() -> usize {
    4096
}
fn default_per_message_chars() -> usize {
    200
}

/// Sub-agent spawning limits. Exceeding either denies the spawn with a
/// precondition error rather than queueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentPolicy {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_children")]
    pub max_active_children_per_session: usize,
}

impl Default for SubAgentPolicy {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_active_children_per_session: default_max_children(),
        }
    }
}

fn default_max_depth() -> u32 {
    3
}
fn default_max_children() -> usize {
    5
}

/// Per-session agent configuration: prompt, model, tool set, limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub org_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// When `None`, the runtime's `default_model` is used.
    #[serde(default)]
    pub model: Option<ModelRef>,
    /// Tool names to build the session registry from.
    #[serde(default)]
    pub tools: Vec<String>,
    /// `0` means unlimited.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Emit a budget warning when remaining spend drops below this.
    #[serde(default = "default_budget_warning_usd")]
    pub budget_warning_usd: f64,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            org_id: org_id.into(),
            system_prompt: None,
            model: None,
            tools: Vec::new(),
            max_turns: default_max_turns(),
            tool_timeout_ms: default_tool_timeout_ms(),
            context_window_tokens: default_context_window_tokens(),
            compaction: CompactionConfig::default(),
            budget_warning_usd: default_budget_warning_usd(),
        }
    }
}

fn default_max_turns() -> u32 {
    0
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_context_window_tokens() -> u64 {
    200_000
}
fn default_budget_warning_usd() -> f64 {
    1.0
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Explicit API keys per provider; overrides environment lookup.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default = "default_model_ref")]
    pub default_model: ModelRef,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_stale_session_timeout_ms")]
    pub stale_session_timeout_ms: u64,
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
    /// Recognised for embedders that attach an HTTP event-bus adapter; the
    /// core itself constructs nothing for it.
    #[serde(default)]
    pub gateway_enabled: bool,
    #[serde(default)]
    pub sub_agents: SubAgentPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            default_model: default_model_ref(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_session_timeout_ms: default_stale_session_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
            retry: RetryConfig::default(),
            resume_on_startup: default_true(),
            gateway_enabled: false,
            sub_agents: SubAgentPolicy::default(),
        }
    }
}

fn default_model_ref() -> ModelRef {
    ModelRef::new("anthropic", "claude-sonnet-4")
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_stale_session_timeout_ms() -> u64 {
    300_000
}
fn default_keepalive_ms() -> u64 {
    15_000
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.stale_session_timeout_ms, 300_000);
        assert_eq!(cfg.keepalive_ms, 15_000);
        assert!(cfg.resume_on_startup);
        assert!(!cfg.gateway_enabled);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.sub_agents.max_depth, 3);
    }

    #[test]
    fn agent_config_defaults() {
        let cfg = AgentConfig::new("helper", "acme");
        assert_eq!(cfg.max_turns, 0);
        assert_eq!(cfg.tool_timeout_ms, 30_000);
        assert!((cfg.compaction.threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.compaction.keep_recent, 10);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{ "keepalive_ms": 5000 }"#).unwrap();
        assert_eq!(cfg.keepalive_ms, 5000);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
    }
}
