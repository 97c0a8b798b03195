//! Session and package persistence
//!
//! [`Store`] is the row-level contract the pipeline relies on: one row
//! update per status transition, no multi-row transactions. [`PgStore`] is
//! the PostgreSQL implementation.

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use kbfetch_common::types::{PackageTask, Session, SessionKey, StatusFlags, StorageAccount};
use kbfetch_common::KbError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

mod postgres;

pub use postgres::PgStore;

/// Database operation errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored status column does not decode
    #[error("Invalid stored status: {0}")]
    Status(#[from] KbError),

    /// Requested record does not exist
    #[error("{0}")]
    NotFound(String),

    /// Record already exists (unique constraint violation)
    #[error("{0}")]
    Duplicate(String),
}

impl DbError {
    pub fn not_found(resource_type: &str, identifier: &str) -> Self {
        Self::NotFound(format!("{} '{}' not found in database", resource_type, identifier))
    }

    pub fn duplicate(resource_type: &str, identifier: &str) -> Self {
        Self::Duplicate(format!("{} '{}' already exists", resource_type, identifier))
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// A package row together with the session it belongs to
#[derive(Debug, Clone)]
pub struct StoredPackage {
    pub session: SessionKey,
    pub task: PackageTask,
}

/// Sessions without the cleanup tombstone, grouped by session identity
pub type SessionGroups = BTreeMap<String, Vec<Session>>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a session in the `Registered` state
    async fn register_session(&self, key: &SessionKey, account: Option<&StorageAccount>)
        -> DbResult<()>;

    /// Insert a package row under `session`, keyed by its title
    async fn insert_package(&self, session: &SessionKey, task: &PackageTask) -> DbResult<()>;

    async fn update_session_status(&self, session: &SessionKey, status: StatusFlags)
        -> DbResult<()>;

    async fn update_package_status(
        &self,
        session: &SessionKey,
        title: &str,
        status: StatusFlags,
    ) -> DbResult<()>;

    async fn record_package_checksum(
        &self,
        session: &SessionKey,
        title: &str,
        checksum: &str,
    ) -> DbResult<()>;

    /// Sessions whose status satisfies `status & mask == value`
    async fn query_sessions_by_status(&self, mask: u32, value: u32) -> DbResult<Vec<Session>>;

    /// Every session without `CLEANUP_COMPLETE`, grouped by identity
    async fn query_all_sessions_grouped_by_identity(&self) -> DbResult<SessionGroups>;

    /// Packages of every session sharing `session_id`, ordered by catalog key
    async fn list_packages(&self, session_id: &str) -> DbResult<Vec<StoredPackage>>;
}

/// Group sessions by identity, preserving input order within a group
pub fn group_by_identity(sessions: impl IntoIterator<Item = Session>) -> SessionGroups {
    let mut groups = SessionGroups::new();
    for session in sessions {
        groups.entry(session.key.id.clone()).or_default().push(session);
    }
    groups
}

pub async fn create_pool(config: &DatabaseConfig) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
