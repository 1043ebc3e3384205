//! Kernel-to-wall-clock timestamp conversion.
//!
//! BPF programs stamp events with `bpf_ktime_get_ns` (CLOCK_MONOTONIC).
//! The offset between the monotonic clock and the epoch is sampled once at
//! startup; per-event conversion is then a single add.

use std::time::{SystemTime, UNIX_EPOCH};

/// Converts monotonic kernel timestamps to epoch seconds.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    /// Epoch nanoseconds at monotonic zero.
    offset_ns: i128,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i128;

        Self {
            offset_ns: epoch_ns - monotonic_ns() as i128,
        }
    }

    /// Convert a kernel (monotonic) timestamp to epoch seconds.
    pub fn to_epoch_secs(&self, ktime_ns: u64) -> f64 {
        (self.offset_ns + ktime_ns as i128) as f64 / 1e9
    }

    /// Current wall-clock time in epoch seconds.
    pub fn now_epoch_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns current monotonic clock value in nanoseconds.
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does
    // not require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_tracks_wall_clock() {
        let clock = MonotonicClock::new();
        let converted = clock.to_epoch_secs(monotonic_ns());
        let now = clock.now_epoch_secs();

        // Sampling skew between the two reads stays well under a second.
        assert!((converted - now).abs() < 1.0);
    }

    #[test]
    fn test_monotonic_increases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
