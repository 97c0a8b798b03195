//! Common types used across kbfetch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub mod status;

pub use status::{Stage, StatusFlags};

/// One downloadable file as reported by catalog discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub title: String,
    pub download_url: String,
    pub architecture: String,
    pub filename: String,
    pub language: String,
    pub size_bytes: i64,
}

/// Identity of a session row: the registration key shared by every catalog
/// key submitted together, plus the catalog key itself
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub id: String,
    pub kbno: i64,
}

impl SessionKey {
    pub fn new(id: impl Into<String>, kbno: i64) -> Self {
        Self { id: id.into(), kbno }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/KB{}", self.id, self.kbno)
    }
}

/// Remote storage account a session archives into
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccount {
    pub name: String,
    pub key: String,
}

// The key is a secret; keep it out of logs.
impl fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One catalog key's unit of work (maps to the `session` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub account: Option<StorageAccount>,
    pub status: StatusFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A freshly registered session
    pub fn registered(key: SessionKey, account: Option<StorageAccount>) -> Self {
        let now = Utc::now();
        Self {
            key,
            account,
            status: StatusFlags::registered(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sessions without a storage account stop after the download stage
    pub fn uploads_enabled(&self) -> bool {
        self.account.is_some()
    }

    /// Staging directory for this session under `root`. All catalog keys of
    /// one registration share the directory.
    pub fn staging_dir(&self, root: &Path) -> PathBuf {
        staging_dir(root, &self.key.id)
    }
}

/// Staging directory for a session identity
pub fn staging_dir(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id)
}

/// One file of a session (maps to the `package` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageTask {
    pub title: String,
    pub download_url: String,
    pub architecture: String,
    pub filename: String,
    pub language: String,
    pub size_bytes: i64,
    pub status: StatusFlags,
    pub checksum: Option<String>,
}

impl PackageTask {
    /// A task discovered from catalog metadata. Discovery and insertion are
    /// one conceptual step, so new tasks start at `MetadataComplete`.
    pub fn from_metadata(metadata: PackageMetadata) -> Self {
        Self {
            title: metadata.title,
            download_url: metadata.download_url,
            architecture: metadata.architecture,
            filename: metadata.filename,
            language: metadata.language,
            size_bytes: metadata.size_bytes,
            status: StatusFlags::new(Stage::MetadataComplete),
            checksum: None,
        }
    }

    /// Blob key the staged file is archived under
    pub fn object_key(&self, session_id: &str) -> String {
        format!("{}/{}", session_id, self.filename)
    }
}
