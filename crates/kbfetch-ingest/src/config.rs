//! HTTP client configuration shared by the catalog scraper and the fetcher

use crate::error::{IngestError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CATALOG_BASE_URL: &str = "https://www.catalog.update.microsoft.com";
pub const DEFAULT_USER_AGENT: &str = concat!("kbfetch/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    pub user_agent: String,

    /// Root of the update catalog site (no trailing slash)
    pub catalog_base_url: String,

    /// Attempts per download, including the first
    pub max_retries: u32,

    /// Backoff before retry `n` is `retry_backoff_ms * 2^(n-1)`
    pub retry_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            catalog_base_url: DEFAULT_CATALOG_BASE_URL.to_string(),
            max_retries: 3,
            retry_backoff_ms: 2000,
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(IngestError::Config("http.timeout_secs must be greater than 0".into()));
        }
        if self.max_retries == 0 {
            return Err(IngestError::Config("http.max_retries must be at least 1".into()));
        }
        if !self.catalog_base_url.starts_with("http://")
            && !self.catalog_base_url.starts_with("https://")
        {
            return Err(IngestError::Config(format!(
                "http.catalog_base_url is not an http(s) URL: {}",
                self.catalog_base_url
            )));
        }
        Ok(())
    }

    /// Base URL with any trailing slash removed
    pub fn catalog_base(&self) -> &str {
        self.catalog_base_url.trim_end_matches('/')
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn build_client(&self) -> Result<Client> {
        self.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .user_agent(self.user_agent.clone())
            .build()?;
        Ok(client)
    }
}
