use std::path::PathBuf;

use thiserror::Error;

pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to append to dataset {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize dataset entry: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("webhook transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected entry with status {status}")]
    Rejected { status: u16 },
    #[error("record from {url} has neither identifier nor title")]
    InvalidRecord { url: String },
}
