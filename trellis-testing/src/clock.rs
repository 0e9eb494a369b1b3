//! Controllable clock.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use trellis_transport::DateTimeProvider;
use trellis_transport::clock::saturating_add;

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    /// Clock starting at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::starting_at(DateTime::UNIX_EPOCH + TimeDelta::days(19723))
    }

    /// Clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = saturating_add(*now, by);
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeProvider for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
