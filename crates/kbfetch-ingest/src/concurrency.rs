//! Bounded execution gate for network operations
//!
//! One [`ConcurrencyController`] is shared by every session in the process.
//! Downloads, uploads and catalog discovery each hold one permit for the
//! duration of the network call; the permit is released when it is dropped,
//! so early returns and errors cannot leak a slot.

use crate::error::{IngestError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One occupied slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct OperationPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyController {
    /// A gate admitting at most `capacity` operations (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<OperationPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| IngestError::GateClosed)?;
        Ok(OperationPermit { _permit: permit })
    }

    /// Run `operation` while holding a slot
    pub async fn gated<F>(&self, operation: F) -> Result<F::Output>
    where
        F: Future,
    {
        let _permit = self.acquire().await?;
        Ok(operation.await)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_OPERATIONS)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_permit_is_released_on_drop() {
        let gate = ConcurrencyController::new(2);
        let permit = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.available(), 1);
        drop(permit);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let gate = ConcurrencyController::new(0);
        assert_eq!(gate.capacity(), 1);
        assert_eq!(gate.gated(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_gated_releases_slot_when_operation_fails() {
        let gate = ConcurrencyController::new(1);
        let outcome: std::result::Result<(), &str> =
            gate.gated(async { Err("boom") }).await.unwrap();
        assert!(outcome.is_err());
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_capacity() {
        let gate = ConcurrencyController::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                gate.gated(async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.in_flight(), 0);
    }
}
