//! Process-wide monotonic clock
//!
//! Sample timestamps and watchdog arithmetic use microseconds since
//! the first call in this process; wall-clock time appears only in
//! operator-facing events.

use once_cell::sync::Lazy;
use std::time::Instant;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

pub fn now_monotonic_us() -> u64 {
    ANCHOR.elapsed().as_micros() as u64
}

pub fn now_monotonic_ms() -> u64 {
    ANCHOR.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_monotonic_us();
        let b = now_monotonic_us();
        assert!(b >= a);
    }
}
