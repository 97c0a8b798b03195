//! Error types shared across kbfetch crates

use thiserror::Error;

/// Result type alias for kbfetch operations
pub type Result<T> = std::result::Result<T, KbError>;

/// Main error type for kbfetch
#[derive(Error, Debug)]
pub enum KbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid status bits: {0:#x}")]
    InvalidStatus(u32),

    #[error("Unknown checksum algorithm: {0}")]
    UnknownChecksumAlgorithm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
