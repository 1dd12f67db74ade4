use std::time::{Duration, Instant, SystemTime};

/// Returns the current monotonic time. All protocol timers are computed off
/// this clock; wall-clock jumps do not affect it.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Saturating distance between two instants, zero if `until` is in the past.
#[inline]
pub fn until(now: Instant, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}
