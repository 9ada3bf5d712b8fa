//! Microsecond-precision wall-clock timestamps.
//!
//! `Timestamp` is a plain `i64` count of microseconds since the Unix epoch.
//! It is `Copy`, totally ordered, and cheap to pass through callbacks, which
//! is what the poller and timer queue need. The default value is *invalid*
//! (zero) and compares before every real time.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// An invalid (zero) timestamp.
    pub const fn invalid() -> Self {
        Self { micros: 0 }
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        // A clock before the epoch would be a system misconfiguration;
        // fall back to the invalid timestamp rather than panicking.
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64 * MICROS_PER_SEC + d.subsec_micros() as i64)
            .unwrap_or(0);
        Self { micros }
    }

    pub const fn valid(&self) -> bool {
        self.micros > 0
    }

    pub const fn micros(&self) -> i64 {
        self.micros
    }

    /// This timestamp shifted forward by `d`.
    pub fn add(&self, d: Duration) -> Self {
        Self {
            micros: self.micros + d.as_micros() as i64,
        }
    }

    /// Microseconds from `earlier` to `self`; negative if `self` is earlier.
    pub fn micros_since(&self, earlier: Timestamp) -> i64 {
        self.micros - earlier.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.micros / MICROS_PER_SEC;
        let micros = self.micros % MICROS_PER_SEC;
        write!(f, "{}.{:06}", secs, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.valid());
        assert!(b >= a);
    }

    #[test]
    fn test_seconds_and_micros_combine() {
        // 1_700_000_000s + 42us must not alias into the wrong magnitude.
        let ts = Timestamp::from_micros(1_700_000_000 * MICROS_PER_SEC + 42);
        assert_eq!(ts.micros() / MICROS_PER_SEC, 1_700_000_000);
        assert_eq!(ts.micros() % MICROS_PER_SEC, 42);
    }

    #[test]
    fn test_add_duration() {
        let ts = Timestamp::from_micros(1_000_000);
        let later = ts.add(Duration::from_millis(1500));
        assert_eq!(later.micros_since(ts), 1_500_000);
    }

    #[test]
    fn test_invalid_sorts_first() {
        assert!(Timestamp::invalid() < Timestamp::now());
        assert!(!Timestamp::invalid().valid());
    }

    #[test]
    fn test_display() {
        let ts = Timestamp::from_micros(3 * MICROS_PER_SEC + 7);
        assert_eq!(ts.to_string(), "3.000007");
    }
}
