//! Gateway trait and error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{CompletionRequest, CompletionResponse, StreamEvent};

/// Errors from the completion API.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("context overflow: used {used} tokens, limit is {limit}")]
    ContextOverflow { used: usize, limit: usize },
}

impl LlmError {
    /// Transient errors are retried inside the gateway.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Network(_) | LlmError::Timeout => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::InvalidResponse(_) | LlmError::ContextOverflow { .. } => false,
        }
    }
}

impl From<LlmError> for crate::error::GyreError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::ContextOverflow { used, limit } => crate::error::GyreError::ContextOverflow { used, limit },
            other => crate::error::GyreError::Llm(other.to_string()),
        }
    }
}

/// Stateless completion service.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// One blocking completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion. The logical result is identical to `complete`;
    /// intermediate events go to `sink` in order. A closed sink must not
    /// abort the upstream call.
    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_transient()
        );
        assert!(LlmError::Network("reset".to_string()).is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(
            LlmError::Api {
                status: 503,
                message: "overloaded".to_string()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Api {
                status: 400,
                message: "bad request".to_string()
            }
            .is_transient()
        );
        assert!(!LlmError::InvalidResponse("garbage".to_string()).is_transient());
        assert!(!LlmError::ContextOverflow { used: 10, limit: 5 }.is_transient());
    }

    #[test]
    fn test_context_overflow_converts_to_engine_error() {
        let err: crate::error::GyreError = LlmError::ContextOverflow { used: 10, limit: 5 }.into();
        assert!(matches!(err, crate::error::GyreError::ContextOverflow { .. }));
    }
}
