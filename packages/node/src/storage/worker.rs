//! Background worker that drives write-behind flushing.
//!
//! A generic `BackgroundWorker<R>` processes tasks from an mpsc channel via a
//! `BackgroundRunnable`, with a periodic tick. [`FlushRunnable`] sweeps due
//! writes on every tick and on demand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::storage::map_data_store::MapDataStore;

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// Handle to a spawned worker task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The task channel holds up to 64 entries.
    pub fn start(mut runnable: R, tick: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(task) => runnable.run(task).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task without waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is full.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .try_send(task)
                .map_err(|e| anyhow::anyhow!("worker channel unavailable: {e}")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stop the worker and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether the worker task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Tasks accepted by [`FlushRunnable`].
#[derive(Debug)]
pub enum FlushTask {
    /// Run a sweep now instead of waiting for the next tick.
    Sweep,
}

/// Flushes due writes of one data store.
pub struct FlushRunnable<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    map_name: String,
    data_store: Arc<dyn MapDataStore<K, V>>,
}

impl<K, V> FlushRunnable<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(map_name: impl Into<String>, data_store: Arc<dyn MapDataStore<K, V>>) -> Self {
        Self {
            map_name: map_name.into(),
            data_store,
        }
    }

    async fn sweep(&self) {
        let report = self.data_store.flush_due().await;
        if report.flushed > 0 || report.failed > 0 {
            debug!(
                map = %self.map_name,
                flushed = report.flushed,
                failed = report.failed,
                pending = self.data_store.pending_operation_count(),
                "write-behind sweep"
            );
        }
    }
}

#[async_trait]
impl<K, V> BackgroundRunnable for FlushRunnable<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Task = FlushTask;

    async fn run(&mut self, task: FlushTask) {
        match task {
            FlushTask::Sweep => self.sweep().await,
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }

    async fn shutdown(&mut self) {
        let pending = self.data_store.pending_operation_count();
        if pending > 0 {
            warn!(map = %self.map_name, pending, "flush worker stopped with pending writes");
        } else {
            debug!(map = %self.map_name, "flush worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use mapstore_core::EntryCodec;

    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::backends::InMemoryStore;
    use crate::storage::datastores::WriteBehindDataStore;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (CountingRunnable, [Arc<AtomicU32>; 3]) {
        let counters = [
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        ];
        let runnable = CountingRunnable {
            run_count: counters[0].clone(),
            tick_count: counters[1].clone(),
            shutdown_called: counters[2].clone(),
        };
        (runnable, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn submit_tick_and_stop() {
        let (runnable, [runs, ticks, shutdowns]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));

        worker.try_submit("a".to_string()).unwrap();
        worker.try_submit("b".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.try_submit("c".to_string()).is_err());

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runnable_sweeps_on_tick() {
        let store = Arc::new(InMemoryStore::new());
        let config = CacheConfig::new("test");
        let data_store: Arc<dyn MapDataStore<String, String>> = Arc::new(
            WriteBehindDataStore::<String, String>::new(store.clone(), EntryCodec::default(), &config),
        );
        let mut worker = BackgroundWorker::start(
            FlushRunnable::new("test", Arc::clone(&data_store)),
            config.flush_tick,
        );

        data_store.add("k".to_string(), Arc::new("v".to_string()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.payload("k").is_none());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(store.payload("k").as_deref(), Some("v"));
        assert_eq!(data_store.pending_operation_count(), 0);

        worker.stop().await;
    }
}
