use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Upload queue shut down")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
