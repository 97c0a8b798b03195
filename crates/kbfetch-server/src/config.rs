//! Configuration management
//!
//! Layering, lowest to highest precedence:
//!
//! 1. built-in defaults (the constants below)
//! 2. TOML file given with `--config`
//! 3. `KBFETCH_`-prefixed environment variables, `__` separating sections
//!    (`KBFETCH_DAEMON__POLL_INTERVAL_SECS=5`)
//! 4. `DATABASE_URL`
//!
//! A `.env` file in the working directory is loaded first.

use anyhow::Context;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use kbfetch_common::checksum::ChecksumAlgorithm;
use kbfetch_common::logging::LogConfig;
use kbfetch_ingest::HttpConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Daemon Configuration Constants
// ============================================================================

/// Delay between polling cycles.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Sessions processed at the same time.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 10;

/// Network operations (discovery, download, upload) in flight across all sessions.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 10;

/// Root under which each session identity gets a staging directory.
pub const DEFAULT_STAGING_DIR: &str = "./staging";

// ============================================================================
// Database Configuration Constants
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/kbfetch";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Storage Configuration Constants
// ============================================================================

/// Container (bucket) every session archives into.
pub const DEFAULT_CONTAINER: &str = "kbdownloader";
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";

pub const ENV_PREFIX: &str = "KBFETCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub poll_interval_secs: u64,
    pub max_concurrent_sessions: usize,
    pub max_concurrent_operations: usize,
    pub staging_dir: PathBuf,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            checksum_algorithm: ChecksumAlgorithm::Md5,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// S3-compatible object storage. Credentials come from each session's
/// storage account, not from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Custom endpoint (MinIO and friends); `None` uses AWS
    pub endpoint: Option<String>,
    pub region: String,
    pub container: String,
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_STORAGE_REGION.to_string(),
            container: DEFAULT_CONTAINER.to_string(),
            path_style: true,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .extract()
            .context("Failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.daemon.poll_interval_secs == 0 {
            anyhow::bail!("daemon.poll_interval_secs must be greater than 0");
        }

        if self.daemon.max_concurrent_sessions == 0 {
            anyhow::bail!("daemon.max_concurrent_sessions must be greater than 0");
        }

        if self.daemon.max_concurrent_operations == 0 {
            anyhow::bail!("daemon.max_concurrent_operations must be greater than 0");
        }

        if self.storage.container.is_empty() {
            anyhow::bail!("storage.container cannot be empty");
        }

        self.http.validate()?;

        Ok(())
    }
}
