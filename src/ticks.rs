//! Monotonic tick source scaled to the GameCube bus clock.

use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// GameCube CPU ticks per second (486 MHz, always).
pub const TICKS_PER_SEC: u64 = 486_000_000;

/// GBA clock ticks per second (2^24 Hz).
pub const GBA_TICKS_PER_SEC: u64 = 16_777_216;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Host monotonic time scaled into GameCube ticks.
pub fn now() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    let nanos = epoch.elapsed().as_nanos();
    (nanos * u128::from(TICKS_PER_SEC) / 1_000_000_000) as u64
}

/// Block the calling thread for approximately `ticks` GameCube ticks.
pub fn sleep(ticks: u64) {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(TICKS_PER_SEC);
    thread::sleep(Duration::from_nanos(nanos as u64));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn sleep_waits_at_least_the_requested_ticks() {
        let start = Instant::now();
        // 1/100 s worth of GameCube ticks.
        sleep(TICKS_PER_SEC / 100);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
