//! Shared domain types for the Harbor agent runtime.
//!
//! Everything that crosses a crate boundary lives here: the message model,
//! the model-stream delta vocabulary, the error taxonomy, configuration,
//! the clock abstraction, and the cancellation token.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod tool;

pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgentConfig, CompactionConfig, ModelRef, RetryConfig, RuntimeConfig, SubAgentPolicy,
};
pub use error::{Error, Result};
pub use message::{approx_tokens, ContentBlock, Message, MessageContent, Role};
pub use stream::{BoxStream, ModelDelta, StopReason};
pub use tool::{ToolCall, ToolDef};
