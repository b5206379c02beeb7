use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hb_domain::{CancelToken, Result, ToolDef};

/// How much damage a tool can do. Policy hooks use this to gate execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// One content item in a tool's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolBlock {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

/// The result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: Vec<ToolBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful plain-text result.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: vec![ToolBlock::Text {
                text: content.into(),
            }],
            metadata: None,
            error: None,
        }
    }

    /// Error result carrying a plain-text message.
    pub fn err(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            success: false,
            content: vec![ToolBlock::Text { text: msg.clone() }],
            metadata: None,
            error: Some(msg),
        }
    }
}

/// Ambient context handed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_id: String,
    pub turn: u32,
    pub cancel: CancelToken,
}

/// An externally supplied side-effectful operation the model may invoke.
///
/// `name` must be unique within a session's registry. Errors should be
/// returned, not panicked — the executor converts both into error results,
/// but an `Err` keeps the message intact.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Human-readable label for UIs and audit records.
    fn label(&self) -> &str;
    fn category(&self) -> &str;
    fn risk(&self) -> RiskLevel;
    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;
    async fn execute(
        &self,
        call_id: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult>;
}

/// Definition sent to the model for a tool.
pub fn tool_def(tool: &dyn Tool) -> ToolDef {
    ToolDef {
        name: tool.name().to_owned(),
        description: tool.label().to_owned(),
        parameters: tool.parameters(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_order() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn err_result_mirrors_message_into_content() {
        let r = ToolResult::err("boom");
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(matches!(&r.content[0], ToolBlock::Text { text } if text == "boom"));
    }
}
