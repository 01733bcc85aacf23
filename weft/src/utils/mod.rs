pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

mod sys;
pub(crate) use sys::page_size;

use nix::time::{ClockId, clock_gettime};

/// Milliseconds since an arbitrary fixed point, read from
/// `CLOCK_MONOTONIC_RAW`. This clock is the authority for every deadline
/// in the runtime; it never observes NTP slew or wall-clock jumps.
pub fn now_ms() -> u64 {
    // The raw monotonic clock cannot fail on any kernel we support.
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC_RAW).expect("clock_gettime(CLOCK_MONOTONIC_RAW)");
    ts.tv_sec() as u64 * 1_000 + ts.tv_nsec() as u64 / 1_000_000
}
