//! Persistence worker pool.
//!
//! Each worker is a long-lived tokio task that pops operations from its
//! lane of the [`FactQueue`] and executes them on a storage connection it
//! owns exclusively. The connection is opened on the first operation and
//! kept until the worker exits.
//!
//! Workers exit when the shared alive flag is cleared, after finishing the
//! operation they are executing. An operation that fails is logged with its
//! caption and dropped; the worker keeps going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::queue::{FactQueue, PersistenceOperation};
use crate::storage::{ConnectionRole, Storage, StorageConnection};

/// Counters returned by one worker when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker: usize,
    pub executed: u64,
    pub failed: u64,
}

/// Totals for a stopped pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Operations executed successfully.
    pub executed: u64,
    /// Operations that failed and were dropped.
    pub failed: u64,
    /// Operations still queued when the workers stopped.
    pub abandoned: usize,
}

pub struct WorkerPool {
    alive: Arc<AtomicBool>,
    queue: Arc<FactQueue>,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `count` workers. Must be called from within a tokio runtime.
    pub fn start(
        count: usize,
        queue: Arc<FactQueue>,
        storage: Arc<dyn Storage>,
        alive: Arc<AtomicBool>,
        idle: Duration,
    ) -> Self {
        let handles = (0..count)
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    queue.clone(),
                    storage.clone(),
                    alive.clone(),
                    idle,
                ))
            })
            .collect();

        tracing::debug!(workers = count, "persistence workers started");
        Self {
            alive,
            queue,
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Clear the alive flag, wake idle workers and wait for all of them.
    pub async fn stop(self) -> ShutdownReport {
        self.alive.store(false, Ordering::Release);
        self.queue.wake_all();

        let mut report = ShutdownReport::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => {
                    report.executed += stats.executed;
                    report.failed += stats.failed;
                }
                Err(e) => tracing::error!(error = %e, "persistence worker panicked"),
            }
        }
        report.abandoned = self.queue.len();
        report
    }
}

async fn run_worker(
    index: usize,
    queue: Arc<FactQueue>,
    storage: Arc<dyn Storage>,
    alive: Arc<AtomicBool>,
    idle: Duration,
) -> WorkerStats {
    let mut conn: Option<Box<dyn StorageConnection>> = None;
    let mut stats = WorkerStats {
        worker: index,
        ..WorkerStats::default()
    };

    while alive.load(Ordering::Acquire) {
        let Some(op) = queue.dequeue_for(index) else {
            tokio::select! {
                _ = queue.wait_for_work() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        };

        if execute(index, storage.as_ref(), &mut conn, &op).await {
            stats.executed += 1;
        } else {
            stats.failed += 1;
        }
        queue.complete();
    }

    if let Some(c) = conn.take() {
        if let Err(e) = c.close().await {
            tracing::warn!(worker = index, error = %e, "failed to close worker connection");
        }
    }

    tracing::debug!(
        worker = index,
        executed = stats.executed,
        failed = stats.failed,
        "persistence worker stopped"
    );
    stats
}

/// Run one operation. Returns `false` if it was dropped.
async fn execute(
    index: usize,
    storage: &dyn Storage,
    conn: &mut Option<Box<dyn StorageConnection>>,
    op: &PersistenceOperation,
) -> bool {
    if conn.is_none() {
        match storage.connect(ConnectionRole::Worker(index)).await {
            Ok(c) => *conn = Some(c),
            Err(e) => {
                tracing::warn!(
                    worker = index,
                    op_id = %op.id,
                    caption = %op.caption,
                    error = %e,
                    "cannot open worker connection; operation dropped"
                );
                return false;
            }
        }
    }
    let Some(c) = conn.as_mut() else {
        return false;
    };

    match c.execute(&op.statement).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(
                worker = index,
                op_id = %op.id,
                caption = %op.caption,
                error = %e,
                "persistence operation failed; dropped"
            );
            false
        }
    }
}
