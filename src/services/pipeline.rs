//! Process-wide, lock-guarded home of the analysis pipeline.
//!
//! The pipeline is expensive to build and not proven safe for concurrent use,
//! so each process holds exactly one instance and runs callers against it one
//! at a time. The handle never leaves [`ExecutionSlot::with_pipeline`].

use futures::future::BoxFuture;
use std::sync::OnceLock;
use tokio::sync::Mutex;

use crate::services::vision::Analyzer;

/// The analyzer shared by every task executed in this process.
pub static PIPELINE: ExecutionSlot<Box<dyn Analyzer>> = ExecutionSlot::new();

pub struct ExecutionSlot<R> {
    inner: OnceLock<Mutex<R>>,
}

impl<R> ExecutionSlot<R> {
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Build the resource unless one already exists.
    ///
    /// Returns `true` only for the call that actually initialized it; later
    /// calls do not run `build` and leave the existing instance in place.
    pub fn init_once<F>(&self, build: F) -> bool
    where
        F: FnOnce() -> R,
    {
        let mut initialized = false;
        self.inner.get_or_init(|| {
            initialized = true;
            Mutex::new(build())
        });
        initialized
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Run `f` with exclusive access to the resource.
    ///
    /// The lock is released when `f`'s future completes, fails or is dropped.
    pub async fn with_pipeline<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, T>,
    {
        let lock = self.inner.get().ok_or(PipelineError::Uninitialized)?;
        let mut guard = lock.lock().await;
        Ok(f(&mut *guard).await)
    }
}

impl<R> Default for ExecutionSlot<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Analysis pipeline has not been initialized in this process")]
    Uninitialized,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Resource {
        serial: usize,
        runs: usize,
    }

    #[test]
    fn test_init_once_is_idempotent() {
        let slot = ExecutionSlot::new();
        let builds = AtomicUsize::new(0);
        let build = || Resource {
            serial: builds.fetch_add(1, Ordering::SeqCst),
            runs: 0,
        };

        assert!(slot.init_once(build));
        assert!(!slot.init_once(build));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let (serial, address) = tokio_test::block_on(slot.with_pipeline(|r| {
            Box::pin(async move { (r.serial, r as *const Resource as usize) })
        }))
        .unwrap();
        let address_again = tokio_test::block_on(
            slot.with_pipeline(|r| Box::pin(async move { r as *const Resource as usize })),
        )
        .unwrap();

        assert_eq!(serial, 0);
        assert_eq!(address, address_again);
    }

    #[tokio::test]
    async fn test_uninitialized_slot_refuses_access() {
        let slot: ExecutionSlot<Resource> = ExecutionSlot::new();
        let outcome = slot.with_pipeline(|r| Box::pin(async move { r.runs })).await;
        assert!(matches!(outcome, Err(PipelineError::Uninitialized)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_are_serialized() {
        let slot: &'static ExecutionSlot<Resource> = Box::leak(Box::new(ExecutionSlot::new()));
        slot.init_once(|| Resource { serial: 0, runs: 0 });

        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                slot.with_pipeline(move |r| {
                    Box::pin(async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        r.runs += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let runs = slot.with_pipeline(|r| Box::pin(async move { r.runs })).await.unwrap();
        assert_eq!(runs, 8);
    }

    #[tokio::test]
    async fn test_lock_released_after_panicking_caller() {
        let slot: &'static ExecutionSlot<Resource> = Box::leak(Box::new(ExecutionSlot::new()));
        slot.init_once(|| Resource { serial: 0, runs: 0 });

        let crashed = tokio::spawn(async move {
            slot.with_pipeline(|r| {
                Box::pin(async move {
                    assert!(r.runs > 0, "analysis crashed");
                    r.runs
                })
            })
            .await
        })
        .await;
        assert!(crashed.is_err());

        let runs = tokio::time::timeout(
            Duration::from_secs(1),
            slot.with_pipeline(|r| Box::pin(async move { r.runs })),
        )
        .await
        .expect("lock must be free after a panic")
        .unwrap();
        assert_eq!(runs, 0);
    }
}
