use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP error! status: {0}")]
    Status(StatusCode),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed stream record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}
