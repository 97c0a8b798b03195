//! Error type for catalog discovery and package transfer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Catalog error for KB{kbno}: {message}")]
    Catalog { kbno: i64, message: String },

    #[error("Concurrency gate closed")]
    GateClosed,
}

impl IngestError {
    /// Failures that a later attempt could plausibly get past
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Http(e) => e.is_timeout() || e.is_connect(),
            IngestError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
