//! In-memory fakes for the pipeline's collaborators

#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use kbfetch_common::checksum::ChecksumAlgorithm;
use kbfetch_common::types::{
    PackageMetadata, PackageTask, Session, SessionKey, StatusFlags, StorageAccount,
};
use kbfetch_ingest::{CatalogClient, ConcurrencyController, IngestError, PackageFetcher};
use kbfetch_server::db::{group_by_identity, DbError, DbResult, SessionGroups, Store, StoredPackage};
use kbfetch_server::pipeline::{PipelineOrchestrator, PipelineSettings};
use kbfetch_server::storage::{BlobStore, BlobStoreFactory};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const CONTAINER: &str = "kbdownloader";

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kbfetch_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn account() -> StorageAccount {
    StorageAccount {
        name: "archive".to_string(),
        key: "secret".to_string(),
    }
}

pub fn metadata(title: &str, filename: &str) -> PackageMetadata {
    PackageMetadata {
        title: title.to_string(),
        download_url: format!("https://download.example.com/{}", filename),
        architecture: "AMD64".to_string(),
        filename: filename.to_string(),
        language: "all".to_string(),
        size_bytes: 0,
    }
}

/// Peak concurrency tracker
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    sessions: BTreeMap<SessionKey, Session>,
    packages: Vec<StoredPackage>,
    session_history: HashMap<SessionKey, Vec<u32>>,
    failing_inserts: HashSet<String>,
    fail_status_writes: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a session row directly, bypassing registration
    pub fn put_session(&self, session: Session) {
        let mut state = self.state.lock().unwrap();
        state
            .session_history
            .entry(session.key.clone())
            .or_default()
            .push(session.status.bits());
        state.sessions.insert(session.key.clone(), session);
    }

    pub fn session(&self, key: &SessionKey) -> Session {
        self.state.lock().unwrap().sessions[key].clone()
    }

    /// Every status value persisted for `key`, oldest first
    pub fn history(&self, key: &SessionKey) -> Vec<u32> {
        self.state.lock().unwrap().session_history[key].clone()
    }

    pub fn packages(&self, key: &SessionKey) -> Vec<PackageTask> {
        self.state
            .lock()
            .unwrap()
            .packages
            .iter()
            .filter(|p| &p.session == key)
            .map(|p| p.task.clone())
            .collect()
    }

    pub fn fail_insert_of(&self, title: &str) {
        self.state.lock().unwrap().failing_inserts.insert(title.to_string());
    }

    pub fn fail_status_writes(&self) {
        self.state.lock().unwrap().fail_status_writes = true;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_session(
        &self,
        key: &SessionKey,
        account: Option<&StorageAccount>,
    ) -> DbResult<()> {
        if self.state.lock().unwrap().sessions.contains_key(key) {
            return Err(DbError::duplicate("session", &key.to_string()));
        }
        self.put_session(Session::registered(key.clone(), account.cloned()));
        Ok(())
    }

    async fn insert_package(&self, session: &SessionKey, task: &PackageTask) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_inserts.contains(&task.title) {
            return Err(DbError::duplicate("package", &task.title));
        }
        state.packages.push(StoredPackage {
            session: session.clone(),
            task: task.clone(),
        });
        Ok(())
    }

    async fn update_session_status(
        &self,
        session: &SessionKey,
        status: StatusFlags,
    ) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_status_writes {
            return Err(DbError::NotFound("status writes disabled".to_string()));
        }
        let row = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| DbError::not_found("session", &session.to_string()))?;
        row.status = status;
        state
            .session_history
            .entry(session.clone())
            .or_default()
            .push(status.bits());
        Ok(())
    }

    async fn update_package_status(
        &self,
        session: &SessionKey,
        title: &str,
        status: StatusFlags,
    ) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_status_writes {
            return Err(DbError::NotFound("status writes disabled".to_string()));
        }
        let row = state
            .packages
            .iter_mut()
            .find(|p| &p.session == session && p.task.title == title)
            .ok_or_else(|| DbError::not_found("package", title))?;
        row.task.status = status;
        Ok(())
    }

    async fn record_package_checksum(
        &self,
        session: &SessionKey,
        title: &str,
        checksum: &str,
    ) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .packages
            .iter_mut()
            .find(|p| &p.session == session && p.task.title == title)
            .ok_or_else(|| DbError::not_found("package", title))?;
        row.task.checksum = Some(checksum.to_string());
        Ok(())
    }

    async fn query_sessions_by_status(&self, mask: u32, value: u32) -> DbResult<Vec<Session>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.status.matches(mask, value))
            .cloned()
            .collect())
    }

    async fn query_all_sessions_grouped_by_identity(&self) -> DbResult<SessionGroups> {
        let sessions: Vec<Session> = self
            .state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|s| !s.status.is_cleaned_up())
            .cloned()
            .collect();
        Ok(group_by_identity(sessions))
    }

    async fn list_packages(&self, session_id: &str) -> DbResult<Vec<StoredPackage>> {
        let mut packages: Vec<StoredPackage> = self
            .state
            .lock()
            .unwrap()
            .packages
            .iter()
            .filter(|p| p.session.id == session_id)
            .cloned()
            .collect();
        packages.sort_by_key(|p| p.session.kbno);
        Ok(packages)
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Default)]
pub struct FakeCatalog {
    entries: Mutex<HashMap<i64, Vec<PackageMetadata>>>,
    /// When set, discovery waits for a permit before answering
    hold: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery blocks until the returned semaphore gets permits
    pub fn held() -> (Self, Arc<Semaphore>) {
        let hold = Arc::new(Semaphore::new(0));
        let catalog = Self {
            hold: Some(Arc::clone(&hold)),
            ..Self::default()
        };
        (catalog, hold)
    }

    pub fn with(self, kbno: i64, packages: Vec<PackageMetadata>) -> Self {
        self.entries.lock().unwrap().insert(kbno, packages);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn discover(&self, kbno: i64) -> kbfetch_ingest::Result<Vec<PackageMetadata>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            let _permit = hold.acquire().await.map_err(|_| IngestError::GateClosed)?;
        }
        self.entries
            .lock()
            .unwrap()
            .get(&kbno)
            .cloned()
            .ok_or(IngestError::Catalog {
                kbno,
                message: "search page returned 500".to_string(),
            })
    }
}

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Default)]
pub struct FakeFetcher {
    failing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
    delay: Duration,
    /// Report success without writing anything to disk
    hollow: bool,
    pub concurrency: Concurrency,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Every fetch succeeds but leaves no file behind
    pub fn hollow() -> Self {
        Self {
            hollow: true,
            ..Self::default()
        }
    }

    pub fn fail(self, filename: &str) -> Self {
        self.failing.lock().unwrap().insert(filename.to_string());
        self
    }

    /// URLs requested, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

/// Bytes the fake fetcher writes for a URL
pub fn body_for(url: &str) -> Vec<u8> {
    format!("payload of {}", url).into_bytes()
}

#[async_trait]
impl PackageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> kbfetch_ingest::Result<u64> {
        self.concurrency.enter();
        self.fetched.lock().unwrap().push(url.to_string());
        tokio::time::sleep(self.delay).await;

        let filename = url.rsplit('/').next().unwrap_or_default().to_string();
        let result = if self.failing.lock().unwrap().contains(&filename) {
            Err(IngestError::Status {
                status: 404,
                url: url.to_string(),
            })
        } else if self.hollow {
            Ok(0)
        } else {
            let body = body_for(url);
            tokio::fs::write(dest, &body)
                .await
                .map(|_| body.len() as u64)
                .map_err(IngestError::from)
        };

        self.concurrency.exit();
        result
    }
}

// ============================================================================
// Blob storage
// ============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    containers: Mutex<HashSet<String>>,
    failing_keys: Mutex<HashSet<String>>,
    panicking_keys: Mutex<HashSet<String>>,
    fail_container: bool,
    delay: Duration,
    connects: AtomicUsize,
    puts: AtomicUsize,
    pub concurrency: Concurrency,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn broken_container() -> Arc<Self> {
        Arc::new(Self {
            fail_container: true,
            ..Self::default()
        })
    }

    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    /// `put` for `key` panics instead of returning
    pub fn panic_on(&self, key: &str) {
        self.panicking_keys.lock().unwrap().insert(key.to_string());
    }

    /// Completed `put` calls, duplicates included
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(CONTAINER.to_string(), key.to_string()))
            .cloned()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_container(&self, container: &str) -> anyhow::Result<()> {
        if self.fail_container {
            return Err(anyhow!("403 AuthorizationFailure"));
        }
        self.containers.lock().unwrap().insert(container.to_string());
        Ok(())
    }

    async fn put(&self, container: &str, key: &str, path: &Path) -> anyhow::Result<()> {
        if self.panicking_keys.lock().unwrap().contains(key) {
            panic!("storage client crashed uploading {}", key);
        }
        self.concurrency.enter();
        tokio::time::sleep(self.delay).await;

        let result = if self.failing_keys.lock().unwrap().contains(key) {
            Err(anyhow!("503 ServerBusy"))
        } else if !self.containers.lock().unwrap().contains(container) {
            Err(anyhow!("404 ContainerNotFound"))
        } else {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    self.objects
                        .lock()
                        .unwrap()
                        .insert((container.to_string(), key.to_string()), bytes);
                    self.puts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Err(e) => Err(e.into()),
            }
        };

        self.concurrency.exit();
        result
    }
}

/// Hands out the same in-memory store for every account
pub struct MemoryBlobFactory(pub Arc<MemoryBlobStore>);

impl BlobStoreFactory for MemoryBlobFactory {
    fn connect(&self, _account: &StorageAccount) -> anyhow::Result<Arc<dyn BlobStore>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.0) as Arc<dyn BlobStore>)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<FakeCatalog>,
    pub fetcher: Arc<FakeFetcher>,
    pub blobs: Arc<MemoryBlobStore>,
    pub staging: TempDir,
}

impl Harness {
    pub fn new(catalog: FakeCatalog, fetcher: FakeFetcher, blobs: Arc<MemoryBlobStore>) -> Self {
        init_tracing();
        Self {
            store: MemoryStore::new(),
            catalog: Arc::new(catalog),
            fetcher: Arc::new(fetcher),
            blobs,
            staging: tempfile::tempdir().unwrap(),
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging.path().to_path_buf()
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            staging_root: self.staging_root(),
            container: CONTAINER.to_string(),
            checksum_algorithm: ChecksumAlgorithm::Md5,
        }
    }

    pub fn orchestrator(&self, capacity: usize) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::clone(&self.store) as Arc<dyn Store>,
            Arc::clone(&self.catalog) as Arc<dyn CatalogClient>,
            Arc::clone(&self.fetcher) as Arc<dyn PackageFetcher>,
            Arc::new(MemoryBlobFactory(Arc::clone(&self.blobs))),
            ConcurrencyController::new(capacity),
            self.settings(),
        )
    }

    /// Register a session row and return it as the daemon would read it
    pub fn register(&self, id: &str, kbno: i64, account: Option<StorageAccount>) -> Session {
        let session = Session::registered(SessionKey::new(id, kbno), account);
        self.store.put_session(session.clone());
        session
    }
}
