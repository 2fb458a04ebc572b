use thiserror::Error;

#[derive(Debug, Error)]
pub enum MingleError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Start refuses to enter the active state on this.
    #[error("Tool server \"{name}\" not found")]
    ToolServerNotFound { name: String },

    /// Start refuses to enter the active state on this.
    #[error("API provider not resolved: {id}")]
    ProviderNotResolved { id: String },

    #[error("Chat gateway error: {0}")]
    Gateway(String),

    #[error("LLM back-end error: {0}")]
    Backend(String),

    #[error("Workspace document error: {0}")]
    Docs(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MingleError>;
