//! Process-wide monotonic clock
//!
//! Camera frames, surface timestamps and audio buffers are all stamped from
//! this clock so they can be compared across threads.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process
pub fn monotonic_ns() -> u64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Microseconds since the first call in this process
pub fn monotonic_us() -> u64 {
    monotonic_ns() / 1_000
}
