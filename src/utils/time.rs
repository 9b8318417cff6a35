use chrono::Utc;

/// Source of "now" in epoch milliseconds.
///
/// Everything in this crate works in millis; `expiresIn` seconds from
/// credential properties are converted at the refresh-decision boundary only.
/// Injecting the clock keeps lease expiry and credential expiry testable
/// without sleeping.
pub trait Clock: Send + Sync {
    fn millis(&self) -> i64;

    fn seconds(&self) -> i64 {
        self.millis() / 1000
    }
}

/// Wall-clock implementation used everywhere outside of tests.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.millis();
        let b = clock.millis();
        assert!(b >= a);
        assert_eq!(clock.seconds(), clock.millis() / 1000);
    }
}
