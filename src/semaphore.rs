//! Parse channel semaphore.
//!
//! Bounds how many log files are parsed at once. Permits are RAII guards: a
//! parser task that returns early, errors, or panics gives its permit back
//! when the guard drops. Bulk [`release`](ParseChannels::release) never lets
//! the number of permits in circulation exceed the configured capacity.
//!
//! The capacity can be changed in place with
//! [`resize`](ParseChannels::resize). Shrinking takes free permits out of the
//! pool at once; permits still held past the new capacity are retired when
//! their guards drop instead of going back to waiters.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, EngineResult};

/// Counting semaphore with a hard capacity.
pub struct ParseChannels {
    sem: Arc<Semaphore>,
    pool: Arc<Mutex<Pool>>,
}

/// `issued` is the number of permits ever added to `sem` minus those
/// retired. Held permits return to `sem` on drop, so
/// `available + held == issued` at all times.
#[derive(Debug)]
struct Pool {
    capacity: usize,
    issued: usize,
}

/// One acquired parse channel. Dropping it returns the permit, or retires
/// it when the pool has been shrunk below the permits in circulation.
#[derive(Debug)]
pub struct ParsePermit {
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<Mutex<Pool>>,
}

impl Drop for ParsePermit {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        if let Some(permit) = self.permit.take() {
            if pool.issued > pool.capacity {
                permit.forget();
                pool.issued -= 1;
            }
        }
    }
}

impl ParseChannels {
    /// An empty pool. Call [`release_all`](Self::release_all) to prime it.
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(0)),
            pool: Arc::new(Mutex::new(Pool {
                capacity,
                issued: 0,
            })),
        }
    }

    /// A pool with every permit available.
    pub fn primed(capacity: usize) -> Self {
        let channels = Self::new(capacity);
        channels.release_all();
        channels
    }

    pub fn capacity(&self) -> usize {
        self.pool.lock().capacity
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Permits currently held by tasks.
    pub fn in_use(&self) -> usize {
        let issued = self.pool.lock().issued;
        issued.saturating_sub(self.sem.available_permits())
    }

    /// Change the capacity in place.
    ///
    /// Growing tops the pool up to the new capacity. Shrinking removes free
    /// permits immediately; any excess still held is retired as holders
    /// finish, so no waiter gets a permit until fewer than `capacity` are out.
    pub fn resize(&self, capacity: usize) {
        let mut pool = self.pool.lock();
        let previous = pool.capacity;
        pool.capacity = capacity;
        while pool.issued < capacity {
            self.sem.add_permits(1);
            pool.issued += 1;
        }
        while pool.issued > capacity {
            match self.sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    permit.forget();
                    pool.issued -= 1;
                }
                Err(_) => break,
            }
        }
        tracing::debug!(
            previous,
            capacity,
            retiring = pool.issued.saturating_sub(capacity),
            "parse channels resized"
        );
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> EngineResult<ParsePermit> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(self.guard(permit))
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> Option<ParsePermit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.guard(permit))
    }

    fn guard(&self, permit: OwnedSemaphorePermit) -> ParsePermit {
        ParsePermit {
            permit: Some(permit),
            pool: self.pool.clone(),
        }
    }

    /// Return `n` permits to the pool.
    ///
    /// Stops at the first permit that would exceed capacity, logs it, and
    /// reports how many were actually released.
    pub fn release(&self, n: usize) -> EngineResult<usize> {
        let (released, capacity) = self.release_capped(n);
        if released < n {
            tracing::warn!(
                requested = n,
                released,
                capacity,
                "parse channel release stopped at capacity"
            );
            return Err(EngineError::SemaphoreOverflow {
                requested: n,
                released,
                capacity,
            });
        }
        Ok(released)
    }

    /// Release the full configured capacity. Idempotent on a full pool.
    pub fn release_all(&self) -> usize {
        let (released, capacity) = self.release_capped(usize::MAX);
        if released < capacity {
            tracing::debug!(released, capacity, "release_all stopped at capacity");
        }
        released
    }

    fn release_capped(&self, n: usize) -> (usize, usize) {
        let mut pool = self.pool.lock();
        let mut released = 0;
        while released < n && pool.issued < pool.capacity {
            self.sem.add_permits(1);
            pool.issued += 1;
            released += 1;
        }
        (released, pool.capacity)
    }

    /// Refuse further acquires; waiters get [`EngineError::Stopped`].
    pub fn close(&self) {
        self.sem.close();
    }
}
