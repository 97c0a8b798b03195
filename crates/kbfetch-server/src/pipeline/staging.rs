//! Per-file locks over the shared staging directories
//!
//! Every catalog key registered under one identity stages into the same
//! directory, and the daemon runs those sessions concurrently. Holding a
//! [`StagingLocks`] guard for a target path makes the "exists? else fetch"
//! step atomic across sessions: the second session waits, then sees the
//! finished file and skips it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

#[derive(Clone, Default)]
pub struct StagingLocks {
    inner: Arc<Mutex<LockMap>>,
}

fn lock(map: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StagingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder has `path`, then hold it until the guard drops
    pub async fn acquire(&self, path: &Path) -> StagingGuard {
        let entry = Arc::clone(lock(&self.inner).entry(path.to_path_buf()).or_default());
        let held = entry.lock_owned().await;
        StagingGuard {
            locks: Arc::clone(&self.inner),
            path: path.to_path_buf(),
            held: Some(held),
        }
    }

    /// Paths currently held or waited on
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct StagingGuard {
    locks: Arc<Mutex<LockMap>>,
    path: PathBuf,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.held.take();
        let mut map = lock(&self.locks);
        // Only the map's own reference left: nobody holds or waits on it.
        if map
            .get(&self.path)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.path);
        }
    }
}
