use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Blob not found: {bucket}/{name}")]
    BlobNotFound { bucket: String, name: String },

    #[error("Table error: {0}")]
    Table(String),

    #[error("Scraping actor error: {0}")]
    Actor(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Run ledger error: {0}")]
    Ledger(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Worker pool error: {0}")]
    Worker(String),
}

impl MigrationError {
    /// Errors that should stop the process instead of a single batch or item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrationError::Config(_) | MigrationError::Auth(_) | MigrationError::Env(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MigrationError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
