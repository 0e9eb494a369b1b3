//! Back-pressure between a helper producing pages and the code consuming them.
//!
//! The producer takes one slot per emitted page with [`BackPressure::wait`];
//! the consumer hands slots back with [`BackPressure::release`] once it has
//! processed what it received. A producer running ahead of its consumer
//! suspends once `max_concurrency × factor` pages are outstanding.

use crate::error::{HelperError, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default multiple of the concurrency that may be outstanding.
pub const DEFAULT_BACK_PRESSURE_FACTOR: usize = 4;

/// Counting semaphore pacing a helper session.
#[derive(Debug)]
pub struct BackPressure {
    semaphore: Semaphore,
    capacity: usize,
    factor: usize,
    release: Mutex<()>,
}

impl BackPressure {
    /// Coordinator for `max_concurrency` producers; `factor` defaults to
    /// [`DEFAULT_BACK_PRESSURE_FACTOR`].
    pub fn new(max_concurrency: usize, factor: Option<usize>) -> Self {
        let factor = factor.unwrap_or(DEFAULT_BACK_PRESSURE_FACTOR).max(1);
        let capacity = max_concurrency.max(1) * factor;
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            factor,
            release: Mutex::new(()),
        }
    }

    /// Take one slot, suspending until one is free or `token` is cancelled.
    pub async fn wait(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HelperError::BackPressureCancelled),
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(HelperError::BackPressureCancelled),
            },
        }
    }

    /// Hand back up to `factor` slots. Returns how many were released; never
    /// more than are outstanding.
    pub fn release(&self) -> usize {
        let _guard = self.release.lock();
        let outstanding = self.capacity - self.semaphore.available_permits();
        let released = outstanding.min(self.factor);
        if released > 0 {
            self.semaphore.add_permits(released);
        }
        trace!(released, outstanding, "Back-pressure released");
        released
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots handed back per release.
    pub fn factor(&self) -> usize {
        self.factor
    }
}
