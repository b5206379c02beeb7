use serde::{Deserialize, Serialize};

/// A message in a session dialogue (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One typed block inside a message.
///
/// `ToolUse` blocks appear only in assistant messages; `ToolResult` blocks
/// only in user-role messages, carrying the id of the `ToolUse` they answer.
/// The `Unknown` variant absorbs unrecognised tags on read (forward
/// compatibility) — loaders drop it with a warning via [`Message::sanitize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Assistant message carrying ordered blocks (thinking, text, tool_use).
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// User-role message carrying one tool_result block per executed
    /// tool_use, in the order the tool_use blocks appeared.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Ids of all tool_use blocks in this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Drop `Unknown` blocks read from persisted data, warning once per
    /// message. Returns `self` for chaining in loaders.
    pub fn sanitize(mut self) -> Self {
        if let MessageContent::Blocks(blocks) = &mut self.content {
            let before = blocks.len();
            blocks.retain(|b| !matches!(b, ContentBlock::Unknown));
            if blocks.len() < before {
                tracing::warn!(
                    dropped = before - blocks.len(),
                    "ignoring content blocks with unrecognised type tags"
                );
            }
        }
        self
    }

    /// Conservative token estimate: total payload characters / 4.
    pub fn approx_tokens(&self) -> u64 {
        (self.content.payload_len() / 4) as u64
    }
}

impl MessageContent {
    /// Extract and join all plain-text content with `"\n"`.
    /// Thinking, tool_use and tool_result blocks are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Total character count across every payload-bearing field, the basis
    /// of the chars/4 token heuristic.
    pub fn payload_len(&self) -> usize {
        match self {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } | ContentBlock::Thinking { text } => text.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.len(),
                    ContentBlock::Unknown => 0,
                })
                .sum(),
        }
    }
}

/// Estimate tokens for a whole message list.
pub fn approx_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_skips_non_text_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "line one".into() },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "echo".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Thinking { text: "hmm".into() },
            ContentBlock::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn tool_use_ids_in_order() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "working".into() },
            ContentBlock::ToolUse {
                id: "a".into(),
                name: "x".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::ToolUse {
                id: "b".into(),
                name: "y".into(),
                input: serde_json::json!({}),
            },
        ]);
        assert_eq!(msg.tool_use_ids(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_block_tag_deserializes_and_is_sanitized() {
        let raw = r#"{
            "role": "assistant",
            "content": [
                {"type": "text", "text": "hi"},
                {"type": "hologram", "payload": 42}
            ]
        }"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        let msg = msg.sanitize();
        match &msg.content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hi"));
            }
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn approx_tokens_is_chars_over_four() {
        let msg = Message::user("abcdefgh"); // 8 chars
        assert_eq!(msg.approx_tokens(), 2);
        assert_eq!(approx_tokens(&[msg.clone(), msg]), 4);
    }

    #[test]
    fn roundtrip_blocks() {
        let msg = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        }]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
        match &back.content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(
                    &blocks[0],
                    ContentBlock::ToolResult { tool_use_id, is_error: false, .. }
                        if tool_use_id == "t1"
                ));
            }
            _ => panic!("expected blocks"),
        }
    }
}
