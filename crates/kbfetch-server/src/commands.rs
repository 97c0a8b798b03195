//! Operator commands: session registration and package export

use crate::db::Store;
use anyhow::{Context, Result};
use kbfetch_common::types::{SessionKey, StorageAccount};
use std::collections::HashSet;
use std::io::Write;
use tracing::info;
use uuid::Uuid;

/// Session ids name a staging directory, so they must be one plain path component
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        anyhow::bail!(
            "Invalid session id '{}': use up to 64 letters, digits, '-' or '_'",
            id
        );
    }
    Ok(())
}

/// Register one session per catalog key under a shared identity.
/// Returns the identity used.
pub async fn register_sessions(
    store: &dyn Store,
    session_id: Option<String>,
    kbnos: &[i64],
    account: Option<StorageAccount>,
) -> Result<String> {
    if kbnos.is_empty() {
        anyhow::bail!("At least one KB number is required");
    }
    let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    validate_session_id(&id)?;

    let mut seen = HashSet::new();
    for &kbno in kbnos.iter().filter(|kbno| seen.insert(**kbno)) {
        let key = SessionKey::new(id.clone(), kbno);
        store
            .register_session(&key, account.as_ref())
            .await
            .with_context(|| format!("Failed to register {}", key))?;
        info!(session_id = %id, kbno, uploads = account.is_some(), "Session registered");
    }

    Ok(id)
}

/// Write `kbno,title,filename,filesize` for every package of `session_id`
pub async fn export_packages<W: Write>(store: &dyn Store, session_id: &str, writer: W) -> Result<usize> {
    let packages = store
        .list_packages(session_id)
        .await
        .with_context(|| format!("Failed to list packages for {}", session_id))?;

    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["kbno", "title", "filename", "filesize"])?;
    for package in &packages {
        csv.write_record([
            package.session.kbno.to_string(),
            package.task.title.clone(),
            package.task.filename.clone(),
            package.task.size_bytes.to_string(),
        ])?;
    }
    csv.flush()?;

    Ok(packages.len())
}
