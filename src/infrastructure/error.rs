use crate::domain::errors::DomainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Remote store error: http {status}; {message}")]
    RemoteStatus { status: u16, message: String },
    #[error("Duplicate key in {table}: {id}")]
    Duplicate { table: String, id: String },
    #[error("Row mapping error: {0}")]
    Mapping(String),
    #[error("Realtime error: {0}")]
    Realtime(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("State lock poisoned: {0}")]
    StateLock(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl InfraError {
    /// Failures worth retrying: the request may not have reached the store.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::RemoteStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
