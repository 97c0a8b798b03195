//! Checksum utilities for staged files

use crate::error::{KbError, Result};
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;

const BUFFER_SIZE: usize = 8192;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = KbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(KbError::UnknownChecksumAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher over either algorithm
enum Hasher {
    Md5(Md5Context),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(hasher) => hasher.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Md5(ctx) => hex::encode(ctx.compute().0),
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish())
}

/// Compute checksum of a staged file without blocking the runtime
pub async fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_checksum_md5() {
        let mut cursor = Cursor::new(b"Hello, world!");
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(checksum, "6cd3556deb0da54bca060b4c39479839");
    }

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("MD5".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Md5);
        assert_eq!("sha-256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn test_file_checksum_spans_multiple_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.msu");
        let data = vec![b'k'; BUFFER_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();

        let from_file = compute_file_checksum(&path, ChecksumAlgorithm::Md5).await.unwrap();
        let from_memory = compute_checksum(&mut Cursor::new(&data), ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(from_file, from_memory);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = compute_file_checksum(dir.path().join("absent"), ChecksumAlgorithm::Md5).await;
        assert!(matches!(result, Err(KbError::Io(_))));
    }
}
