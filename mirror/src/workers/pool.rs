use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};
use crate::error::{ErrorKind, MirrorResult};
use crate::mirror_error;
use crate::types::TableName;

/// A spawned snapshot worker.
#[derive(Debug)]
struct ActiveWorker {
    /// Signaled once the worker future returned, after its outcome was reported.
    done_rx: SignalRx,
}

impl ActiveWorker {
    fn is_running(&self) -> bool {
        // A closed channel means the task ended without finishing the worker.
        matches!(self.done_rx.has_changed(), Ok(false))
    }
}

/// Internal state for [`SnapshotWorkerPool`].
#[derive(Debug)]
struct SnapshotWorkerPoolInner {
    /// Snapshot workers indexed by the table they copy.
    active: HashMap<TableName, ActiveWorker>,
    /// Owns all spawned worker tasks.
    join_set: JoinSet<(TableName, MirrorResult<()>)>,
}

impl SnapshotWorkerPoolInner {
    fn has_active_worker(&self, table: &TableName) -> bool {
        self.active.get(table).is_some_and(ActiveWorker::is_running)
    }
}

/// Pool of the snapshot workers of one mirror.
///
/// At most one worker runs per table. Workers observe the stop signal of the pool between pages,
/// which lets [`SnapshotWorkerPool::shutdown`] end them without tearing their connector handles.
#[derive(Debug, Clone)]
pub struct SnapshotWorkerPool {
    inner: Arc<Mutex<SnapshotWorkerPoolInner>>,
    stop_tx: Arc<SignalTx>,
}

impl SnapshotWorkerPool {
    /// Creates a new empty snapshot worker pool.
    pub fn new() -> Self {
        let (stop_tx, _) = create_signal();

        Self {
            inner: Arc::new(Mutex::new(SnapshotWorkerPoolInner {
                active: HashMap::new(),
                join_set: JoinSet::new(),
            })),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Returns a receiver that is signaled once the pool shuts down.
    pub fn stop_rx(&self) -> SignalRx {
        self.stop_tx.subscribe()
    }

    /// Spawns `future` as the worker of `table`.
    ///
    /// Returns `false` and drops `future` if a worker for the table is still running.
    pub async fn spawn<F>(&self, table: TableName, future: F) -> bool
    where
        F: Future<Output = MirrorResult<()>> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if inner.has_active_worker(&table) {
            warn!(%table, "snapshot worker already exists in pool and is still running");
            return false;
        }

        let (done_tx, done_rx) = create_signal();
        let worker_table = table.clone();
        inner.join_set.spawn(async move {
            let result = future.await;
            done_tx.send_replace(());
            (worker_table, result)
        });

        let worker = ActiveWorker { done_rx };
        match inner.active.entry(table) {
            Entry::Vacant(entry) => {
                debug!(table = %entry.key(), "spawned snapshot worker in pool");
                entry.insert(worker);
            }
            Entry::Occupied(mut entry) => {
                debug!(table = %entry.key(), "replaced finished snapshot worker in pool");
                entry.insert(worker);
            }
        }

        true
    }

    /// Waits until the worker of `table` returned.
    ///
    /// Returns immediately when the table has no worker. Once this returns, a new worker can be
    /// spawned for the table.
    pub async fn wait_for_worker(&self, table: &TableName) {
        let done_rx = {
            let inner = self.inner.lock().await;
            inner.active.get(table).map(|worker| worker.done_rx.clone())
        };

        if let Some(mut done_rx) = done_rx {
            // Either signal or a dropped sender ends the worker.
            let _ = done_rx.changed().await;
        }
    }

    /// Checks if a worker for `table` is still running.
    pub async fn has_active_worker(&self, table: &TableName) -> bool {
        self.inner.lock().await.has_active_worker(table)
    }

    /// Returns the tables whose worker is still running.
    pub async fn active_tables(&self) -> Vec<TableName> {
        let inner = self.inner.lock().await;

        inner
            .active
            .iter()
            .filter(|(_, worker)| worker.is_running())
            .map(|(table, _)| table.clone())
            .collect()
    }

    /// Waits for every worker of the pool, including workers spawned while waiting.
    ///
    /// Errors of the workers are collected and returned together.
    pub async fn wait_all(&self) -> MirrorResult<()> {
        let mut errors = Vec::new();

        loop {
            // The join set is taken out of the lock, so workers can be spawned while waiting.
            let mut join_set = {
                let mut inner = self.inner.lock().await;
                mem::take(&mut inner.join_set)
            };

            if join_set.is_empty() {
                break;
            }

            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok((table, Ok(()))) => {
                        debug!(%table, "snapshot worker completed");
                    }
                    Ok((table, Err(err))) => {
                        error!(%table, error = %err, "snapshot worker completed with error");
                        errors.push(err);
                    }
                    Err(join_err) if join_err.is_cancelled() => {
                        debug!("snapshot worker task was cancelled");
                    }
                    Err(join_err) => {
                        errors.push(mirror_error!(
                            ErrorKind::SnapshotWorkerPanic,
                            "Snapshot worker panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.active.retain(|_, worker| worker.is_running());

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Signals every worker to stop and waits for them.
    pub async fn shutdown(&self) -> MirrorResult<()> {
        self.stop_tx.send_replace(());

        self.wait_all().await
    }
}

impl Default for SnapshotWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
