//! Resizable worker pool.
//!
//! A [`Semaphore`] whose permit count tracks the allocation controller.
//! Growing adds permits. Shrinking forgets idle permits at once and retires
//! busy ones as they are released, so a resize never waits for work to
//! finish.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::resource::{AllocationListener, AllocationState};
use crate::GovernorError;

#[derive(Debug)]
struct PoolState {
    target: usize,
    /// Busy permits still to be retired on release.
    debt: usize,
}

struct Shared {
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// Concurrency limit for multi-item batches.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// One worker slot. Released (or retired) on drop.
pub struct PoolPermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.debt > 0 {
            state.debt -= 1;
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
        }
    }
}

impl WorkerPool {
    /// Pool with `size` slots (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(size)),
                state: Mutex::new(PoolState {
                    target: size,
                    debt: 0,
                }),
            }),
        }
    }

    /// Wait for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::ChannelClosed`] after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<PoolPermit, GovernorError> {
        let permit = Arc::clone(&self.shared.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GovernorError::ChannelClosed)?;
        Ok(PoolPermit {
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Change the slot count to `size` (minimum 1) without blocking.
    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        let mut state = self.shared.state.lock();
        let old = state.target;
        if size > old {
            let grow = size - old;
            let cancelled = grow.min(state.debt);
            state.debt -= cancelled;
            self.shared.semaphore.add_permits(grow - cancelled);
        } else if size < old {
            let shrink = old - size;
            let forgotten = self.shared.semaphore.forget_permits(shrink);
            state.debt += shrink - forgotten;
        }
        state.target = size;
        if size != old {
            debug!(from = old, to = size, debt = state.debt, "worker pool resized");
        }
    }

    /// Slot count the pool is converging to.
    pub fn size(&self) -> usize {
        self.shared.state.lock().target
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.shared.semaphore.available_permits()
    }

    /// Fail all current and future [`acquire`](Self::acquire) calls.
    pub fn close(&self) {
        self.shared.semaphore.close();
    }
}

impl AllocationListener for WorkerPool {
    fn on_allocation(&self, state: &AllocationState) -> Result<(), GovernorError> {
        self.resize(state.allocated_units);
        info!(workers = state.allocated_units, "worker pool follows allocation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_pool_has_size_permits() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);
        let _p = pool.acquire().await.expect("test: acquire");
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_zero_size_is_clamped_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        pool.resize(0);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_grow_adds_permits() {
        let pool = WorkerPool::new(1);
        pool.resize(4);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_shrink_idle_forgets_immediately() {
        let pool = WorkerPool::new(4);
        pool.resize(2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_shrink_while_busy_retires_on_release() {
        let pool = WorkerPool::new(3);
        let a = pool.acquire().await.expect("test: a");
        let b = pool.acquire().await.expect("test: b");
        let c = pool.acquire().await.expect("test: c");
        pool.resize(1);
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 0, "two busy permits retired");
        drop(c);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_grow_cancels_outstanding_debt_first() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.expect("test: a");
        let b = pool.acquire().await.expect("test: b");
        pool.resize(1); // one unit of debt
        pool.resize(3); // cancels debt, adds one permit
        assert_eq!(pool.available(), 1);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.expect("test: held");
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.await.expect("test: join"));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(GovernorError::ChannelClosed)));
    }

    #[test]
    fn test_allocation_listener_resizes() {
        let pool = WorkerPool::new(2);
        pool.on_allocation(&AllocationState::new(5, "cpu_scale_up"))
            .expect("test: listener");
        assert_eq!(pool.size(), 5);
    }
}
