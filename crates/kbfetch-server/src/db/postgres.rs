//! PostgreSQL-backed [`Store`]

use super::{group_by_identity, DbError, DbResult, SessionGroups, Store, StoredPackage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbfetch_common::types::{PackageTask, Session, SessionKey, StatusFlags, StorageAccount};
use sqlx::PgPool;
use tracing::warn;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_sessions(&self, sql: &str, mask: Option<(u32, u32)>) -> DbResult<Vec<Session>> {
        let mut query = sqlx::query_as::<_, SessionRow>(sql);
        if let Some((mask, value)) = mask {
            query = query.bind(mask as i32).bind(value as i32);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = SessionKey::new(row.id.clone(), row.kbno);
                match Session::try_from(row) {
                    Ok(session) => Some(session),
                    Err(e) => {
                        warn!(session = %key, error = %e, "Skipping session with undecodable status");
                        None
                    },
                }
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    kbno: i64,
    saname: Option<String>,
    sakey: Option<String>,
    status: i32,
    create_utc_date: DateTime<Utc>,
    update_utc_date: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = DbError;

    fn try_from(row: SessionRow) -> DbResult<Self> {
        let account = match (row.saname, row.sakey) {
            (Some(name), Some(key)) if !name.is_empty() && !key.is_empty() => {
                Some(StorageAccount { name, key })
            },
            _ => None,
        };

        Ok(Session {
            key: SessionKey::new(row.id, row.kbno),
            account,
            status: StatusFlags::from_bits(row.status as u32)?,
            created_at: row.create_utc_date,
            updated_at: row.update_utc_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    session_id: String,
    kbno: i64,
    title: String,
    download_link: String,
    architecture: String,
    file_name: String,
    language: String,
    file_size: i64,
    checksum: Option<String>,
    status: i32,
}

impl TryFrom<PackageRow> for StoredPackage {
    type Error = DbError;

    fn try_from(row: PackageRow) -> DbResult<Self> {
        Ok(StoredPackage {
            session: SessionKey::new(row.session_id, row.kbno),
            task: PackageTask {
                title: row.title,
                download_url: row.download_link,
                architecture: row.architecture,
                filename: row.file_name,
                language: row.language,
                size_bytes: row.file_size,
                status: StatusFlags::from_bits(row.status as u32)?,
                checksum: row.checksum,
            },
        })
    }
}

const SESSION_COLUMNS: &str =
    "id, kbno, saname, sakey, status, create_utc_date, update_utc_date";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|d| d.is_unique_violation())
}

#[async_trait]
impl Store for PgStore {
    async fn register_session(
        &self,
        key: &SessionKey,
        account: Option<&StorageAccount>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO session (id, kbno, saname, sakey, status, create_utc_date, update_utc_date)
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW())",
        )
        .bind(&key.id)
        .bind(key.kbno)
        .bind(account.map(|a| a.name.as_str()))
        .bind(account.map(|a| a.key.as_str()))
        .bind(StatusFlags::registered().bits() as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::duplicate("session", &key.to_string())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn insert_package(&self, session: &SessionKey, task: &PackageTask) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO package (session_id, kbno, title, download_link, architecture, file_name,
                                  language, file_size, checksum, status, create_utc_date, update_utc_date)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())",
        )
        .bind(&session.id)
        .bind(session.kbno)
        .bind(&task.title)
        .bind(&task.download_url)
        .bind(&task.architecture)
        .bind(&task.filename)
        .bind(&task.language)
        .bind(task.size_bytes)
        .bind(task.checksum.as_deref())
        .bind(task.status.bits() as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::duplicate("package", &format!("{} {}", session, task.title))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_session_status(
        &self,
        session: &SessionKey,
        status: StatusFlags,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE session SET status = $1, update_utc_date = NOW() WHERE id = $2 AND kbno = $3",
        )
        .bind(status.bits() as i32)
        .bind(&session.id)
        .bind(session.kbno)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("session", &session.to_string()));
        }
        Ok(())
    }

    async fn update_package_status(
        &self,
        session: &SessionKey,
        title: &str,
        status: StatusFlags,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE package SET status = $1, update_utc_date = NOW()
             WHERE session_id = $2 AND kbno = $3 AND title = $4",
        )
        .bind(status.bits() as i32)
        .bind(&session.id)
        .bind(session.kbno)
        .bind(title)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("package", &format!("{} {}", session, title)));
        }
        Ok(())
    }

    async fn record_package_checksum(
        &self,
        session: &SessionKey,
        title: &str,
        checksum: &str,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE package SET checksum = $1, update_utc_date = NOW()
             WHERE session_id = $2 AND kbno = $3 AND title = $4",
        )
        .bind(checksum)
        .bind(&session.id)
        .bind(session.kbno)
        .bind(title)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("package", &format!("{} {}", session, title)));
        }
        Ok(())
    }

    async fn query_sessions_by_status(&self, mask: u32, value: u32) -> DbResult<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM session WHERE status & $1 = $2 ORDER BY create_utc_date, id, kbno",
            SESSION_COLUMNS
        );
        self.fetch_sessions(&sql, Some((mask, value))).await
    }

    async fn query_all_sessions_grouped_by_identity(&self) -> DbResult<SessionGroups> {
        let sql = format!(
            "SELECT {} FROM session WHERE status & $1 = $2 ORDER BY id, kbno",
            SESSION_COLUMNS
        );
        let sessions = self
            .fetch_sessions(&sql, Some((StatusFlags::CLEANUP_COMPLETE, 0)))
            .await?;
        Ok(group_by_identity(sessions))
    }

    async fn list_packages(&self, session_id: &str) -> DbResult<Vec<StoredPackage>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            "SELECT session_id, kbno, title, download_link, architecture, file_name, language,
                    file_size, checksum, status
             FROM package WHERE session_id = $1 ORDER BY kbno, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredPackage::try_from).collect()
    }
}
