/// Error types for the chat subsystem
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChatError {
    /// Whether the error belongs to a class that is surfaced to the caller
    /// (validation, authorization, unknown ids) rather than absorbed.
    pub fn is_fatal_for_caller(&self) -> bool {
        matches!(
            self,
            ChatError::Validation(_) | ChatError::Unauthorized(_) | ChatError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
