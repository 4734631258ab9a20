//! Error types for the stock chat assistant

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {

    // =============================
    // Core Turn Errors
    // =============================

    /// Database unreachable, misbehaving or not configured at all.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Model call or tool loop failed.
    #[error("Agent error: {0}")]
    AgentError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    pub(crate) fn store(context: &str, error: impl std::fmt::Display) -> Self {
        ChatError::StoreUnavailable(format!("{}: {}", context, error))
    }
}
