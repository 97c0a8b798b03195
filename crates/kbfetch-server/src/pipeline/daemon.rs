//! Polling daemon
//!
//! Each cycle picks up sessions still carrying the `Registered` bit, hands
//! each to the orchestrator on its own task (bounded by a session-level
//! semaphore, separate from the network operation gate), then runs the
//! cleanup sweep. A session stays in the in-flight set until its task ends,
//! so a session seen twice before it leaves `Registered` is dispatched once.

use super::cleanup::{self, CleanupReport};
use super::orchestrator::PipelineOrchestrator;
use crate::config::DaemonConfig;
use crate::db::Store;
use kbfetch_common::types::{SessionKey, StatusFlags};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

type InFlight = Arc<Mutex<HashSet<SessionKey>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<SessionKey>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a session from the in-flight set when its task ends, panics included
struct InFlightGuard {
    set: InFlight,
    key: SessionKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: usize,
    pub cleanup: CleanupReport,
}

pub struct DaemonLoop {
    store: Arc<dyn Store>,
    orchestrator: PipelineOrchestrator,
    session_slots: Arc<Semaphore>,
    poll_interval: Duration,
    staging_root: PathBuf,
    in_flight: InFlight,
    running: JoinSet<()>,
}

impl DaemonLoop {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: PipelineOrchestrator,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            session_slots: Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1))),
            poll_interval: config.poll_interval(),
            staging_root: config.staging_dir.clone(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            running: JoinSet::new(),
        }
    }

    /// Sessions dispatched and not yet finished
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Poll until `shutdown` resolves, then wait for in-flight sessions
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            session_slots = self.session_slots.available_permits(),
            operation_slots = self.orchestrator.gate().capacity(),
            "Daemon started"
        );
        tokio::pin!(shutdown);

        loop {
            let report = self.run_cycle().await;
            debug!(?report, "Cycle complete");

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {},
            }
        }

        info!(in_flight = self.in_flight(), "Shutdown requested, waiting for sessions");
        self.drain().await;
        info!("Daemon stopped");
    }

    /// One poll: reap finished tasks, dispatch registered sessions, sweep
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.reap_finished();
        let dispatched = self.dispatch_registered().await;
        let cleanup = cleanup::sweep(self.store.as_ref(), &self.staging_root).await;
        CycleReport {
            dispatched,
            cleanup,
        }
    }

    /// Wait for every dispatched session to finish
    pub async fn drain(&mut self) {
        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task ended abnormally");
            }
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Session task ended abnormally");
            }
        }
    }

    async fn dispatch_registered(&mut self) -> usize {
        // A registered row carrying the error flag cannot start; leave it out.
        let sessions = match self
            .store
            .query_sessions_by_status(
                StatusFlags::REGISTERED | StatusFlags::ERROR,
                StatusFlags::REGISTERED,
            )
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "Failed to query registered sessions");
                return 0;
            },
        };

        let mut dispatched = 0;
        for session in sessions {
            if !lock(&self.in_flight).insert(session.key.clone()) {
                debug!(session = %session.key, "Session already in flight");
                continue;
            }
            let guard = InFlightGuard {
                set: Arc::clone(&self.in_flight),
                key: session.key.clone(),
            };
            let slots = Arc::clone(&self.session_slots);
            let orchestrator = self.orchestrator.clone();

            info!(session_id = %session.key.id, kbno = session.key.kbno, "Dispatching session");
            self.running.spawn(async move {
                let _guard = guard;
                let Ok(_slot) = slots.acquire_owned().await else {
                    return;
                };
                orchestrator.process_session(session).await;
            });
            dispatched += 1;
        }

        dispatched
    }
}
