//! Wall-clock abstraction
//!
//! The flush cycle files records by the minute they arrive in and the upload
//! cycle seals segments by age, so both read time through [`Clock`]. Tests
//! drive a [`MockClock`] instead of sleeping across minute boundaries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> SystemTime;
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for tests
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl MockClock {
    /// Clock frozen at `time`
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Clock frozen at `secs` seconds after the Unix epoch
    pub fn at_unix(secs: u64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now += duration;
    }

    /// Jump to an arbitrary time
    pub fn set_time(&self, time: SystemTime) {
        *self.now.write() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::with_time(SystemTime::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read()
    }
}

/// Whole seconds since the Unix epoch, negative before it
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advances() {
        let clock = MockClock::at_unix(1_000);
        assert_eq!(unix_seconds(clock.now()), 1_000);

        clock.advance(Duration::from_secs(61));
        assert_eq!(unix_seconds(clock.now()), 1_061);

        clock.set_time(UNIX_EPOCH);
        assert_eq!(unix_seconds(clock.now()), 0);
    }

    #[test]
    fn test_unix_seconds_before_epoch() {
        let time = UNIX_EPOCH - Duration::from_secs(90);
        assert_eq!(unix_seconds(time), -90);
    }
}
