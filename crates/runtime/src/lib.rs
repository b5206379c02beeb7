//! Harbor runtime — the session lifecycle supervisor and think-act loop.
//!
//! The [`Runtime`] is the library's external surface: spawn sessions, send
//! messages, terminate, schedule follow-ups, spawn sub-agents, subscribe to
//! event streams. Collaborators (store, model client, tools, hooks, clock)
//! are traits supplied by the embedder; nothing here speaks HTTP or knows a
//! provider wire format.

pub mod audit;
pub mod cancel;
pub mod compact;
pub mod email;
pub mod events;
pub mod followups;
pub mod hooks;
pub mod keys;
pub mod supervisor;
pub mod turn;

use std::path::Path;

use hb_domain::config::RuntimeConfig;
use hb_domain::{Error, Result};

pub use audit::StoreAuditHook;
pub use cancel::CancelMap;
pub use email::{DedupeStore, EmailDelivery, InboundEmail};
pub use events::{EventBus, SessionEvent};
pub use hooks::{
    BudgetDecision, Hook, HookChain, LlmUsage, ToolGate, ToolHookContext, ToolOutcome,
};
pub use supervisor::{
    AdminStore, CustomProviderSpec, Runtime, SpawnOptions, SubAgentRequest, SubAgentResult,
};
pub use turn::{AgentLoop, LoopOutcome};

/// Load a [`RuntimeConfig`] from a TOML file. Missing fields take their
/// documented defaults.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|e| Error::InvalidArgument(format!("config parse: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
keepalive_ms = 5000

[default_model]
provider = "anthropic"
model_id = "claude-sonnet-4"

[api_keys]
anthropic = "sk-test"

[retry]
max_retries = 5
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.keepalive_ms, 5000);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.api_keys.get("anthropic").unwrap(), "sk-test");
    }

    #[test]
    fn malformed_config_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "keepalive_ms = \"soon\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }
}
