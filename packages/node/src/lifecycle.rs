//! Cache readiness and shutdown state with in-flight mutation tracking.
//!
//! Uses `ArcSwap` for lock-free state reads on every facade call and an atomic
//! counter with RAII guards so shutdown can wait for in-flight mutations
//! before the final flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Cache lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Initial load has not completed.
    Starting,
    /// Serving reads and writes.
    Ready,
    /// Rejecting mutations while pending writes are flushed.
    Draining,
    /// Flushed and stopped.
    Stopped,
}

/// Tracks the lifecycle of one cache instance.
#[derive(Debug)]
pub struct CacheLifecycle {
    ready_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<CacheState>,
}

impl CacheLifecycle {
    /// Creates a lifecycle in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            ready_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(CacheState::Starting),
        }
    }

    /// Marks the initial load complete and notifies readiness receivers.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(CacheState::Ready));
        self.ready_signal.send_replace(true);
    }

    /// Returns a receiver that flips to `true` once the cache is ready.
    #[must_use]
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready_signal.subscribe()
    }

    /// Moves to `Draining`. New mutations are rejected from here on.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(CacheState::Draining));
        self.ready_signal.send_replace(false);
    }

    /// Moves to `Stopped`.
    pub fn set_stopped(&self) {
        self.state.store(Arc::new(CacheState::Stopped));
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CacheState {
        **self.state.load()
    }

    /// Creates an RAII guard that tracks an in-flight mutation.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of mutations currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for in-flight mutations to finish, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for CacheLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
