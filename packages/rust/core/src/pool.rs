//! Bounded worker pool for ingestion runners.
//!
//! `max_pending` caps admitted-but-unfinished executions (checked before any
//! write is made on a submission). `max_concurrent` caps how many of those
//! actually run at once; the rest wait for a slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use warehouse_shared::{Result, WarehouseError, WorkerConfig};

/// Shared runner pool owned by the ingest service.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    root: CancellationToken,
    tracker: TaskTracker,
}

/// Proof that a submission holds one pending slot. Released on drop.
#[derive(Debug)]
pub struct Admission {
    pending: Arc<AtomicUsize>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: config.max_pending.max(1),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Reserve room for one more execution.
    ///
    /// Fails with `Overloaded` when `max_pending` executions are already in
    /// flight, and with `Cancelled` once shutdown has begun.
    pub fn admit(&self) -> Result<Admission> {
        if self.root.is_cancelled() {
            return Err(WarehouseError::Cancelled(
                "ingest service is shutting down".into(),
            ));
        }

        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= self.max_pending {
                return Err(WarehouseError::Overloaded { pending: current });
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(Admission {
            pending: Arc::clone(&self.pending),
        })
    }

    /// Run `job` on the pool once a slot frees up.
    ///
    /// The job receives a child cancellation token. If shutdown starts while
    /// it is still queued, it runs anyway with the token already cancelled so
    /// it can record its final state.
    pub fn spawn<F, Fut>(&self, admission: Admission, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let slots = Arc::clone(&self.slots);

        self.tracker.spawn(async move {
            let _admission = admission;
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = slots.acquire_owned() => permit.ok(),
            };
            job(token).await;
        });
    }

    /// Executions admitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every runner and wait until all of them have returned.
    pub async fn shutdown(&self) {
        debug!(pending = self.pending(), "shutting down worker pool");
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
