//! Staging directory cleanup
//!
//! Sessions registered together share one staging directory, so the
//! directory can only go once every member of the group has finished
//! uploading. Removal comes first; the `CLEANUP_COMPLETE` tombstone is only
//! written after the directory is gone.

use crate::db::Store;
use kbfetch_common::types::{Session, Stage};
use kbfetch_ingest::download::target_path;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Groups whose directory was removed and sessions tombstoned
    pub cleaned: usize,
    /// Groups still waiting on a member
    pub pending: usize,
    /// Groups whose removal failed; retried next sweep
    pub failed: usize,
}

/// Whether every session sharing an identity has finished uploading
pub fn group_complete(members: &[Session]) -> bool {
    !members.is_empty()
        && members
            .iter()
            .all(|s| s.status.stage() == Stage::UploadComplete)
}

/// Remove `dir` recursively. A directory that is already gone counts as removed.
pub async fn remove_staging_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// One cleanup pass over every session not yet tombstoned
pub async fn sweep(store: &dyn Store, staging_root: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();

    let groups = match store.query_all_sessions_grouped_by_identity().await {
        Ok(groups) => groups,
        Err(e) => {
            error!(error = %e, "Cleanup query failed");
            return report;
        },
    };

    for (session_id, members) in groups {
        if !group_complete(&members) {
            report.pending += 1;
            continue;
        }

        let Some(dir) = target_path(staging_root, &session_id) else {
            warn!(session_id = %session_id, "Session id is not a plain directory name, not cleaning");
            report.failed += 1;
            continue;
        };

        if let Err(e) = remove_staging_dir(&dir).await {
            warn!(session_id = %session_id, dir = %dir.display(), error = %e, "Failed to remove staging directory");
            report.failed += 1;
            continue;
        }
        debug!(session_id = %session_id, dir = %dir.display(), "Staging directory removed");

        for session in members {
            let mut next = session.status;
            if !next.mark_cleaned_up() {
                continue;
            }
            if let Err(e) = store.update_session_status(&session.key, next).await {
                warn!(session = %session.key, error = %e, "Failed to persist cleanup status");
            }
        }

        info!(session_id = %session_id, "Session cleanup complete");
        report.cleaned += 1;
    }

    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use kbfetch_common::types::{SessionKey, StatusFlags};

    fn session(kbno: i64, stage: Stage) -> Session {
        let mut session = Session::registered(SessionKey::new("grp", kbno), None);
        session.status = StatusFlags::new(stage);
        session
    }

    #[test]
    fn test_group_complete_needs_every_member() {
        assert!(group_complete(&[session(1, Stage::UploadComplete)]));
        assert!(!group_complete(&[
            session(1, Stage::UploadComplete),
            session(2, Stage::DownloadComplete),
        ]));
        assert!(!group_complete(&[]));
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("gone");
        assert!(remove_staging_dir(&dir).await.is_ok());

        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/a.msu"), b"x").unwrap();
        remove_staging_dir(&dir).await.unwrap();
        assert!(!dir.exists());
    }
}
