//! Package file transfer

use crate::config::HttpConfig;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Downloads one URL to a local path
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    /// On error `dest` does not exist.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Streaming HTTP fetcher with retry on transient failures
pub struct HttpFetcher {
    client: Client,
    config: HttpConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = config.build_client()?;
        Ok(Self { client, config })
    }

    async fn fetch_once(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let partial = partial_path(dest);
        let written = match stream_to_file(response, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            },
        };
        tokio::fs::rename(&partial, dest).await?;

        Ok(written)
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(url, dest).await {
                Ok(written) => {
                    info!(url, dest = %dest.display(), bytes = written, "Downloaded package");
                    return Ok(written);
                },
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        url,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Download failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Local path for a remote file name inside `dir`. Names that would escape
/// `dir` (absolute paths, `..`, empty) are rejected.
pub fn target_path(dir: &Path, filename: &str) -> Option<PathBuf> {
    let name = Path::new(filename).file_name()?;
    if name != std::ffi::OsStr::new(filename) {
        return None;
    }
    Some(dir.join(name))
}

/// Sibling path the body is streamed into before the final rename
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    debug!(path = %path.display(), bytes = written, "Body streamed to disk");

    Ok(written)
}
