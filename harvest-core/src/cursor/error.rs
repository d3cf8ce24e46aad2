use std::path::PathBuf;

use thiserror::Error;

use super::pagination::PaginationState;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("state store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("invalid pagination transition from {from:?} via {operation}")]
    InvalidTransition {
        from: PaginationState,
        operation: &'static str,
    },
}

pub type StateResult<T> = std::result::Result<T, StateError>;
