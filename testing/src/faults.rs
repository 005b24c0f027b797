//! Failure injection shared by the in-memory stores.
//!
//! One [`Faults`] handle is cloned into every store built for a test, so a
//! step index counts operations across both stores in saga order.

use certflow_core::error::{StoreError, StoreKind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Barrier;

#[derive(Debug, Default)]
struct FaultState {
    applied: AtomicUsize,
    fail_at: Mutex<Option<usize>>,
    relational_commit: AtomicBool,
    document_commit: AtomicBool,
    cache: AtomicBool,
    saga_log: AtomicBool,
    held_reads: Mutex<Option<(Arc<Barrier>, usize)>>,
}

/// Shared switchboard of injected failures.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    state: Arc<FaultState>,
}

impl Faults {
    /// No failures armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the operation at zero-based index `step`, counted from now across
    /// both stores. One-shot.
    pub fn fail_step(&self, step: usize) {
        self.state.applied.store(0, Ordering::SeqCst);
        if let Ok(mut fail_at) = self.state.fail_at.lock() {
            *fail_at = Some(step);
        }
    }

    /// Fail the next relational commit. One-shot.
    pub fn fail_relational_commit(&self) {
        self.state.relational_commit.store(true, Ordering::SeqCst);
    }

    /// Fail the next document commit. One-shot.
    pub fn fail_document_commit(&self) {
        self.state.document_commit.store(true, Ordering::SeqCst);
    }

    /// Make every cache call fail until switched off.
    pub fn set_cache_down(&self, down: bool) {
        self.state.cache.store(down, Ordering::SeqCst);
    }

    /// Make every saga log write fail until switched off.
    pub fn set_saga_log_down(&self, down: bool) {
        self.state.saga_log.store(down, Ordering::SeqCst);
    }

    /// Hold the next `readers` application reads until all of them have
    /// happened, so concurrent writers start from the same version.
    pub fn hold_reads(&self, readers: usize) {
        if let Ok(mut held) = self.state.held_reads.lock() {
            *held = Some((Arc::new(Barrier::new(readers)), readers));
        }
    }

    /// Called by a store before reading an application.
    pub async fn before_read(&self) {
        let barrier = {
            let Ok(mut held) = self.state.held_reads.lock() else {
                return;
            };
            let Some((barrier, left)) = held.as_mut() else {
                return;
            };
            let barrier = Arc::clone(barrier);
            *left -= 1;
            if *left == 0 {
                *held = None;
            }
            barrier
        };
        barrier.wait().await;
    }

    /// Called by a store before applying an operation.
    ///
    /// # Errors
    ///
    /// Returns the injected error when the armed step is reached.
    pub fn before_apply(&self, store: StoreKind) -> Result<(), StoreError> {
        let index = self.state.applied.fetch_add(1, Ordering::SeqCst);
        let Ok(mut fail_at) = self.state.fail_at.lock() else {
            return Ok(());
        };
        if *fail_at == Some(index) {
            *fail_at = None;
            return Err(StoreError::new(store, format!("injected failure at step {index}")));
        }
        Ok(())
    }

    /// Called by a store before committing.
    ///
    /// # Errors
    ///
    /// Returns the injected error if a commit failure is armed for `store`.
    pub fn before_commit(&self, store: StoreKind) -> Result<(), StoreError> {
        let flag = match store {
            StoreKind::Relational => &self.state.relational_commit,
            StoreKind::Document => &self.state.document_commit,
            StoreKind::Cache | StoreKind::SagaLog => return Ok(()),
        };
        if flag.swap(false, Ordering::SeqCst) {
            Err(StoreError::new(store, "injected commit failure"))
        } else {
            Ok(())
        }
    }

    /// Called by the cache before every call.
    ///
    /// # Errors
    ///
    /// Returns an error while the cache is down.
    pub fn check_cache(&self) -> Result<(), StoreError> {
        if self.state.cache.load(Ordering::SeqCst) {
            Err(StoreError::new(StoreKind::Cache, "injected cache outage"))
        } else {
            Ok(())
        }
    }

    /// Called by the saga log before every write.
    ///
    /// # Errors
    ///
    /// Returns an error while the saga log is down.
    pub fn check_saga_log(&self) -> Result<(), StoreError> {
        if self.state.saga_log.load(Ordering::SeqCst) {
            Err(StoreError::new(StoreKind::SagaLog, "injected saga log outage"))
        } else {
            Ok(())
        }
    }
}
