//! Provider-agnostic streaming inference client.
//!
//! Adapters implement [`ModelClient`] by translating their wire format into
//! the [`ModelDelta`] vocabulary; the runtime consumes nothing else. Retry
//! and pricing live here so every adapter gets them for free.

pub mod mock;
pub mod pricing;
pub mod retry;

use async_trait::async_trait;

use hb_domain::config::ModelRef;
use hb_domain::{BoxStream, CancelToken, Message, ModelDelta, Result, ToolDef};

pub use pricing::{ModelPricing, PricingTable};
pub use retry::{stream_with_retry, RetryPolicy};

/// The delta stream a model call yields.
pub type DeltaStream = BoxStream<'static, Result<ModelDelta>>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Resolved by the runtime before the session starts.
    pub api_key: Option<String>,
}

/// A provider-agnostic inference request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: ModelRef,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub options: CallOptions,
}

/// Streaming inference client. One instance may serve many sessions
/// concurrently; each call is independent.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streaming completion. Errors surfaced here (as opposed to
    /// mid-stream) are eligible for retry by [`stream_with_retry`].
    /// Implementations must abandon promptly when `cancel` fires.
    async fn call(&self, req: ModelRequest, cancel: CancelToken) -> Result<DeltaStream>;

    /// Identifier used for API-key resolution and pricing lookup.
    fn provider_id(&self) -> &str;
}

/// Fallback token estimate when a provider omits usage: chars/4 over the
/// final message bodies.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    hb_domain::approx_tokens(messages)
}
