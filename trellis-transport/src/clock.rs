//! Time source for dead-node bookkeeping.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Default time a node stays dead after its first failure.
pub const DEFAULT_DEAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on how long a node can stay dead.
pub const DEFAULT_MAX_DEAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Provides the current time and the dead-node window curve.
///
/// The transport never reads the wall clock directly, so tests can swap in a
/// controllable implementation.
pub trait DateTimeProvider: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Deadline until which a node with `failed_attempts` prior failures stays dead.
    ///
    /// Grows as `dead_timeout * 2 * 2^(0.5 * failed_attempts - 1)`, capped at
    /// `max_dead_timeout`.
    fn dead_time(
        &self,
        failed_attempts: u32,
        dead_timeout: Duration,
        max_dead_timeout: Duration,
    ) -> DateTime<Utc> {
        saturating_add(
            self.now(),
            dead_window(failed_attempts, dead_timeout, max_dead_timeout),
        )
    }
}

/// Length of the dead window for a node with `failed_attempts` prior failures.
pub fn dead_window(failed_attempts: u32, dead_timeout: Duration, max_dead_timeout: Duration) -> Duration {
    let exponent = f64::from(failed_attempts) * 0.5 - 1.0;
    let millis = dead_timeout.as_millis() as f64 * 2.0 * 2f64.powf(exponent);
    let capped = millis.min(max_dead_timeout.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + by`, clamped to the latest representable instant.
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl DateTimeProvider for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
