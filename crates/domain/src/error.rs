/// Shared error type used across all Harbor crates.
///
/// Variants map one-to-one onto the error kinds the runtime surfaces to
/// embedders; `is_transient` drives the model-call retry layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("transient upstream: {0}")]
    TransientUpstream(String),

    #[error("permanent upstream: {0}")]
    PermanentUpstream(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_) | Self::Timeout(_) | Self::Io(_))
    }

    /// Short machine-readable kind tag, used in event payloads and records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::TransientUpstream(_) => "transient_upstream",
            Self::PermanentUpstream(_) => "permanent_upstream",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::ToolFailed(_) => "tool_failed",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::TransientUpstream("503".into()).is_transient());
        assert!(Error::Timeout("connect".into()).is_transient());
        assert!(!Error::Unauthenticated("no key".into()).is_transient());
        assert!(!Error::PermanentUpstream("400".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(Error::BudgetExceeded("daily".into()).kind(), "budget_exceeded");
    }
}
