//! Wall-clock helpers.
//!
//! Deadlines travel as epoch milliseconds because that is the only clock two
//! hosts share (loosely, via NTP). Locally they are converted once into a
//! monotonic [`Instant`] so waits are immune to wall-clock steps.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub fn epoch_millis() -> u64 {
    // A clock set before 1970 reads as the epoch rather than failing.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Time left until `deadline_ms`, zero if it already passed.
pub fn until(deadline_ms: u64) -> Duration {
    until_from(deadline_ms, epoch_millis())
}

pub fn until_from(deadline_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}

/// Monotonic instant matching the epoch deadline.
pub fn deadline_instant(deadline_ms: u64) -> Instant {
    Instant::now() + until(deadline_ms)
}
