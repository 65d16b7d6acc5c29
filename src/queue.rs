//! Write-behind fact queue.
//!
//! An unbounded FIFO of pending persistence operations. All lanes sit
//! behind one mutex that is held only for push/pop, never while a statement
//! executes. With [`QueueRouting::Shared`] there is a single lane every
//! worker pops from; with [`QueueRouting::ByFile`] each worker owns a lane
//! and a log file's operations always go to the same one.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::config::QueueRouting;
use crate::models::Statement;

/// Monotonic id assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// One queued write.
#[derive(Debug, Clone)]
pub struct PersistenceOperation {
    pub id: OperationId,
    /// Log file that produced the operation; drives by-file routing.
    pub owner: Option<i64>,
    pub caption: String,
    pub statement: Statement,
}

struct Lanes {
    routing: QueueRouting,
    lanes: Vec<VecDeque<PersistenceOperation>>,
}

impl Lanes {
    fn lane_for(&self, owner: Option<i64>, id: OperationId) -> usize {
        let n = self.lanes.len();
        if n <= 1 {
            return 0;
        }
        match owner {
            Some(o) => o.rem_euclid(n as i64) as usize,
            None => (id.0 % n as u64) as usize,
        }
    }
}

pub struct FactQueue {
    inner: Mutex<Lanes>,
    next_id: AtomicU64,
    /// Enqueued and not yet completed (includes operations being executed).
    outstanding: AtomicUsize,
    wake: Notify,
}

impl FactQueue {
    pub fn new(routing: QueueRouting, workers: usize) -> Self {
        Self {
            inner: Mutex::new(Lanes {
                routing,
                lanes: make_lanes(routing, workers),
            }),
            next_id: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
            wake: Notify::new(),
        }
    }

    /// Append to the tail of the owner's lane. Never blocks on storage.
    pub fn enqueue(&self, owner: Option<i64>, caption: String, statement: Statement) -> OperationId {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        {
            let mut inner = self.inner.lock();
            let lane = inner.lane_for(owner, id);
            inner.lanes[lane].push_back(PersistenceOperation {
                id,
                owner,
                caption,
                statement,
            });
        }
        self.wake.notify_waiters();
        id
    }

    /// Pop the head of the lane served by `worker`.
    pub fn dequeue_for(&self, worker: usize) -> Option<PersistenceOperation> {
        let mut inner = self.inner.lock();
        let n = inner.lanes.len();
        if n == 0 {
            return None;
        }
        let lane = if n == 1 { 0 } else { worker % n };
        inner.lanes[lane].pop_front()
    }

    /// Mark a dequeued operation as finished, whether it succeeded or not.
    pub fn complete(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Operations waiting in lanes.
    pub fn len(&self) -> usize {
        self.inner.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued plus in-flight operations.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Re-shape lanes for a new worker count or routing mode. Pending
    /// operations are redistributed in their original enqueue order.
    pub fn relane(&self, routing: QueueRouting, workers: usize) {
        let mut inner = self.inner.lock();
        let mut pending: Vec<PersistenceOperation> =
            inner.lanes.iter_mut().flat_map(|l| l.drain(..)).collect();
        pending.sort_by_key(|op| op.id);

        inner.routing = routing;
        inner.lanes = make_lanes(routing, workers);
        for op in pending {
            let lane = inner.lane_for(op.owner, op.id);
            inner.lanes[lane].push_back(op);
        }
    }

    /// Wait for an enqueue notification. Callers pair this with a timeout;
    /// a notification sent before the wait starts is not remembered.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// Wake every idle worker, e.g. on shutdown.
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }
}

fn make_lanes(routing: QueueRouting, workers: usize) -> Vec<VecDeque<PersistenceOperation>> {
    let n = match routing {
        QueueRouting::Shared => 1,
        QueueRouting::ByFile => workers.max(1),
    };
    (0..n).map(|_| VecDeque::new()).collect()
}
