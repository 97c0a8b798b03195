//! Per-session stage machine
//!
//! A session moves strictly forward:
//!
//! ```text
//! Registered -> MetadataInProgress -> MetadataComplete
//!            -> DownloadInProgress -> DownloadComplete
//!            -> UploadInProgress   -> UploadComplete     (only with a storage account)
//! ```
//!
//! Every transition is written to the [`Store`] as it happens. Store write
//! failures are logged and the in-memory state moves on regardless; the
//! row stays authoritative for the next process.

use super::staging::StagingLocks;
use crate::db::Store;
use crate::storage::{BlobStore, BlobStoreFactory};
use anyhow::Result;
use chrono::Utc;
use kbfetch_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
use kbfetch_common::types::{PackageTask, Session, SessionKey, Stage, StatusFlags, StorageAccount};
use kbfetch_ingest::download::target_path;
use kbfetch_ingest::{CatalogClient, ConcurrencyController, PackageFetcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Settings the orchestrator needs from configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub staging_root: PathBuf,
    pub container: String,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl PipelineSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            staging_root: config.daemon.staging_dir.clone(),
            container: config.storage.container.clone(),
            checksum_algorithm: config.daemon.checksum_algorithm,
        }
    }
}

/// Final in-memory state of a processed session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub tasks: Vec<PackageTask>,
}

struct UploadOutcome {
    index: usize,
    result: Result<()>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<dyn Store>,
    catalog: Arc<dyn CatalogClient>,
    fetcher: Arc<dyn PackageFetcher>,
    blobs: Arc<dyn BlobStoreFactory>,
    gate: ConcurrencyController,
    settings: Arc<PipelineSettings>,
    staging_locks: StagingLocks,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn CatalogClient>,
        fetcher: Arc<dyn PackageFetcher>,
        blobs: Arc<dyn BlobStoreFactory>,
        gate: ConcurrencyController,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            fetcher,
            blobs,
            gate,
            settings: Arc::new(settings),
            staging_locks: StagingLocks::new(),
        }
    }

    pub fn gate(&self) -> &ConcurrencyController {
        &self.gate
    }

    /// Drive `session` through every stage it is eligible for
    pub async fn process_session(&self, mut session: Session) -> SessionOutcome {
        info!(
            session_id = %session.key.id,
            kbno = session.key.kbno,
            status = %session.status,
            "Start processing session"
        );

        if !self.set_session_stage(&mut session, Stage::MetadataInProgress).await {
            warn!(
                session_id = %session.key.id,
                kbno = session.key.kbno,
                status = %session.status,
                "Session cannot start, leaving it for an operator"
            );
            return SessionOutcome {
                session,
                tasks: Vec::new(),
            };
        }

        let Some(mut tasks) = self.discover(&mut session).await else {
            return SessionOutcome {
                session,
                tasks: Vec::new(),
            };
        };
        self.set_session_stage(&mut session, Stage::MetadataComplete).await;

        self.download_all(&mut session, &mut tasks).await;

        match session.account.clone() {
            Some(account) => self.upload_all(&mut session, &mut tasks, &account).await,
            None => info!(
                session_id = %session.key.id,
                kbno = session.key.kbno,
                "No storage account, stopping after download"
            ),
        }

        info!(
            session_id = %session.key.id,
            kbno = session.key.kbno,
            status = %session.status,
            "End processing session"
        );
        SessionOutcome { session, tasks }
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    async fn discover(&self, session: &mut Session) -> Option<Vec<PackageTask>> {
        let kbno = session.key.kbno;
        let result = self
            .gate
            .gated(self.catalog.discover(kbno))
            .await
            .and_then(|r| r);

        let metadata = match result {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(
                    session_id = %session.key.id,
                    kbno,
                    error = %e,
                    "Catalog discovery failed, session needs an operator reset to run again"
                );
                self.mark_session_error(session).await;
                return None;
            },
        };

        let mut tasks = Vec::with_capacity(metadata.len());
        for entry in metadata {
            let task = PackageTask::from_metadata(entry);
            match self.store.insert_package(&session.key, &task).await {
                Ok(()) => tasks.push(task),
                Err(e) => warn!(
                    session_id = %session.key.id,
                    kbno,
                    title = %task.title,
                    error = %e,
                    "Failed to insert package, dropping it"
                ),
            }
        }

        info!(session_id = %session.key.id, kbno, packages = tasks.len(), "Metadata stored");
        Some(tasks)
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    async fn download_all(&self, session: &mut Session, tasks: &mut [PackageTask]) {
        self.set_session_stage(session, Stage::DownloadInProgress).await;

        // Sequential within a session: a later package naming an already
        // staged file must observe it and skip.
        let dir = session.staging_dir(&self.settings.staging_root);
        for task in tasks.iter_mut() {
            self.download_one(&session.key, &dir, task).await;
        }

        debug_assert!(tasks.iter().all(|t| t.status.download_settled()));
        self.set_session_stage(session, Stage::DownloadComplete).await;
    }

    async fn download_one(&self, key: &SessionKey, dir: &Path, task: &mut PackageTask) {
        self.set_task_stage(key, task, Stage::DownloadInProgress).await;

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            error!(session = %key, dir = %dir.display(), error = %e, "Cannot create staging directory");
            self.mark_task_error(key, task).await;
            return;
        }

        let Some(path) = target_path(dir, &task.filename) else {
            warn!(session = %key, filename = %task.filename, "Unsafe file name");
            self.mark_task_error(key, task).await;
            return;
        };
        // Sessions of one identity share `dir`; held until the checksum is done.
        let _staged = self.staging_locks.acquire(&path).await;

        match tokio::fs::try_exists(&path).await {
            Ok(true) => {
                info!(session = %key, filename = %task.filename, "File exists, skipping download");
                self.set_task_stage(key, task, Stage::DownloadSkipped).await;
                return;
            },
            Ok(false) => {},
            Err(e) => {
                error!(session = %key, path = %path.display(), error = %e, "Cannot check staged file");
                self.mark_task_error(key, task).await;
                return;
            },
        }

        let fetched = self
            .gate
            .gated(self.fetcher.fetch(&task.download_url, &path))
            .await
            .and_then(|r| r);
        match fetched {
            Ok(bytes) => {
                if task.size_bytes > 0 && bytes != task.size_bytes as u64 {
                    warn!(
                        session = %key,
                        filename = %task.filename,
                        expected = task.size_bytes,
                        actual = bytes,
                        "Downloaded size differs from catalog size"
                    );
                }
            },
            Err(e) => {
                error!(session = %key, filename = %task.filename, error = %e, "Download failed");
                self.mark_task_error(key, task).await;
                return;
            },
        }

        self.set_task_stage(key, task, Stage::DownloadComplete).await;

        match compute_file_checksum(&path, self.settings.checksum_algorithm).await {
            Ok(checksum) => {
                debug!(session = %key, filename = %task.filename, checksum = %checksum, "Checksum computed");
                if let Err(e) = self
                    .store
                    .record_package_checksum(key, &task.title, &checksum)
                    .await
                {
                    warn!(session = %key, title = %task.title, error = %e, "Failed to persist checksum");
                }
                task.checksum = Some(checksum);
            },
            Err(e) => {
                error!(session = %key, filename = %task.filename, error = %e, "Checksum failed");
                self.mark_task_error(key, task).await;
            },
        }
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    async fn upload_all(
        &self,
        session: &mut Session,
        tasks: &mut [PackageTask],
        account: &StorageAccount,
    ) {
        self.set_session_stage(session, Stage::UploadInProgress).await;
        let key = session.key.clone();
        let container = self.settings.container.clone();

        let eligible: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| upload_eligible(task))
            .map(|(index, _)| index)
            .collect();
        for task in tasks.iter().filter(|t| !upload_eligible(t)) {
            debug!(session = %key, filename = %task.filename, status = %task.status, "Not uploading");
        }

        let blob = match self.open_container(account, &container).await {
            Ok(blob) => blob,
            Err(e) => {
                error!(session = %key, container = %container, error = %format!("{:#}", e), "Container unavailable");
                for &index in &eligible {
                    self.mark_task_error(&key, &mut tasks[index]).await;
                }
                self.set_session_stage(session, Stage::UploadComplete).await;
                return;
            },
        };

        let dir = session.staging_dir(&self.settings.staging_root);
        let (tx, mut rx) = mpsc::channel::<UploadOutcome>(eligible.len().max(1));
        let mut uploads = JoinSet::new();
        let mut unreported: BTreeSet<usize> = eligible.iter().copied().collect();

        for &index in &eligible {
            let task = &mut tasks[index];
            self.set_task_stage(&key, task, Stage::UploadInProgress).await;

            let object_key = task.object_key(&key.id);
            let path = dir.join(&task.filename);
            let blob = Arc::clone(&blob);
            let gate = self.gate.clone();
            let container = container.clone();
            let tx = tx.clone();

            uploads.spawn(async move {
                let result = match gate.acquire().await {
                    Ok(_permit) => blob.put(&container, &object_key, &path).await,
                    Err(e) => Err(e.into()),
                };
                let _ = tx.send(UploadOutcome { index, result }).await;
            });
        }
        drop(tx);

        // Only this coordinator writes task status.
        while let Some(outcome) = rx.recv().await {
            unreported.remove(&outcome.index);
            let task = &mut tasks[outcome.index];
            match outcome.result {
                Ok(()) => self.set_task_stage(&key, task, Stage::UploadComplete).await,
                Err(e) => {
                    error!(session = %key, filename = %task.filename, error = %format!("{:#}", e), "Upload failed");
                    self.mark_task_error(&key, task).await;
                },
            }
        }

        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                error!(session = %key, error = %e, "Upload task ended abnormally");
            }
        }
        // A worker that died before reporting leaves its task here.
        for index in unreported {
            let task = &mut tasks[index];
            error!(session = %key, filename = %task.filename, "Upload never reported an outcome");
            self.mark_task_error(&key, task).await;
        }

        self.set_session_stage(session, Stage::UploadComplete).await;
    }

    async fn open_container(
        &self,
        account: &StorageAccount,
        container: &str,
    ) -> Result<Arc<dyn BlobStore>> {
        let blob = self.blobs.connect(account)?;
        blob.ensure_container(container).await?;
        Ok(blob)
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Returns `false` when the transition is refused and nothing was written
    async fn set_session_stage(&self, session: &mut Session, stage: Stage) -> bool {
        let mut next = session.status;
        if !next.advance(stage) {
            debug!(session = %session.key, status = %session.status, to = %stage, "Session transition refused");
            return false;
        }
        self.write_session_status(session, next).await;
        true
    }

    async fn mark_session_error(&self, session: &mut Session) {
        let mut next = session.status;
        if next.mark_error() {
            self.write_session_status(session, next).await;
        }
    }

    async fn write_session_status(&self, session: &mut Session, next: StatusFlags) {
        info!(
            session_id = %session.key.id,
            kbno = session.key.kbno,
            from = %session.status,
            to = %next,
            "Session status changed"
        );
        if let Err(e) = self.store.update_session_status(&session.key, next).await {
            warn!(session = %session.key, error = %e, "Failed to persist session status");
        }
        session.status = next;
        session.updated_at = Utc::now();
    }

    async fn set_task_stage(&self, key: &SessionKey, task: &mut PackageTask, stage: Stage) {
        let mut next = task.status;
        if !next.advance(stage) {
            debug!(session = %key, title = %task.title, status = %task.status, to = %stage, "Package transition refused");
            return;
        }
        self.write_task_status(key, task, next).await;
    }

    async fn mark_task_error(&self, key: &SessionKey, task: &mut PackageTask) {
        let mut next = task.status;
        if next.mark_error() {
            self.write_task_status(key, task, next).await;
        }
    }

    async fn write_task_status(&self, key: &SessionKey, task: &mut PackageTask, next: StatusFlags) {
        debug!(
            session = %key,
            filename = %task.filename,
            from = %task.status,
            to = %next,
            "Package status changed"
        );
        if let Err(e) = self.store.update_package_status(key, &task.title, next).await {
            warn!(session = %key, title = %task.title, error = %e, "Failed to persist package status");
        }
        task.status = next;
    }
}

/// Downloaded in this run and not failed
fn upload_eligible(task: &PackageTask) -> bool {
    !task.status.has_error() && task.status.stage() == Stage::DownloadComplete
}
