//! Central error type for the engine.
//!
//! Subsystems with richer local taxonomies (LLM, worktree) define their own
//! thiserror enums and convert into `GyreError` at the seam.

use thiserror::Error;

/// All error types that can surface from the engine
#[derive(Debug, Error)]
pub enum GyreError {
    /// Record not found in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record id already present on create
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid state transition or operation on a terminal loop
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Validation of a loop's output failed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Storage/persistence error
    #[error("Store error: {0}")]
    Store(String),

    /// LLM gateway error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Tool routing or execution error
    #[error("Tool error: {0}")]
    Tool(String),

    /// Path escaped the loop's worktree sandbox
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    /// Git worktree error
    #[error("Worktree error: {0}")]
    Worktree(String),

    /// Free disk space below the configured floor
    #[error("Insufficient disk space: {available_gb} GB available, floor is {floor_gb} GB")]
    InsufficientSpace { available_gb: u64, floor_gb: u64 },

    /// Prompt did not fit the model context even after truncation
    #[error("Context overflow: {used} estimated tokens, limit is {limit}")]
    ContextOverflow { used: usize, limit: usize },

    /// Signal schema violation (e.g. both target fields set)
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Child descriptor failed schema validation
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Fatal configuration problem at startup
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite index error
    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, GyreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = GyreError::NotFound("loop 001".to_string());
        assert_eq!(err.to_string(), "Not found: loop 001");
    }

    #[test]
    fn test_already_exists_display() {
        let err = GyreError::AlreadyExists("001".to_string());
        assert_eq!(err.to_string(), "Already exists: 001");
    }

    #[test]
    fn test_insufficient_space_display() {
        let err = GyreError::InsufficientSpace {
            available_gb: 2,
            floor_gb: 5,
        };
        assert!(err.to_string().contains("2 GB available"));
        assert!(err.to_string().contains("floor is 5 GB"));
    }

    #[test]
    fn test_context_overflow_display() {
        let err = GyreError::ContextOverflow {
            used: 250_000,
            limit: 200_000,
        };
        assert!(err.to_string().contains("250000"));
        assert!(err.to_string().contains("200000"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GyreError = io_err.into();
        assert!(matches!(err, GyreError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: GyreError = json_err.into();
        assert!(matches!(err, GyreError::Json(_)));
    }
}
