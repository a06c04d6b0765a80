use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Errors that end the whole run rather than a single candidate or keyword.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Configuration(_) | AppError::ConfigSource(_)
        )
    }
}
