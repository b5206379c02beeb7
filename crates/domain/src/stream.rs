use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for model streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while a model response streams in (provider-agnostic).
///
/// Adapters translate their wire format into this vocabulary; everything
/// downstream (the agent loop, the event bus) only ever sees these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelDelta {
    /// A chunk of assistant text.
    TextDelta { text: String },

    /// A chunk of reasoning/thinking content.
    ThinkingDelta { text: String },

    /// The model started emitting a tool invocation.
    ToolUseStart { id: String, name: String },

    /// Incremental tool-input JSON for an in-flight tool invocation.
    ToolUseInputDelta { id: String, partial: String },

    /// A tool invocation is complete with its final parsed input.
    ToolUseEnd { id: String, input: serde_json::Value },

    /// Token accounting reported by the provider.
    Usage { input_tokens: u64, output_tokens: u64 },

    /// The stream is finished.
    Stop { reason: StopReason },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    ContentFilter,
    Error,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_serializes_tagged() {
        let d = ModelDelta::TextDelta { text: "hi".into() };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn stop_reason_tags() {
        assert_eq!(StopReason::EndTurn.as_str(), "end_turn");
        let json = serde_json::to_value(StopReason::MaxTokens).unwrap();
        assert_eq!(json, "max_tokens");
    }
}
