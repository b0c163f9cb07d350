//! Seconds-granularity durations for waits and retry delays.
//!
//! The wire model only carries whole seconds, so this type rounds nothing:
//! construction is exact and sub-second precision does not exist.

use serde::{Deserialize, Serialize};

/// A non-negative duration with whole-second granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Duration {
    seconds: u64,
}

impl Duration {
    /// Zero-length duration.
    pub const ZERO: Duration = Duration { seconds: 0 };

    /// Creates a duration from whole seconds.
    pub const fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    /// Creates a duration from whole minutes.
    pub const fn from_minutes(minutes: u64) -> Self {
        Self {
            seconds: minutes * 60,
        }
    }

    /// Creates a duration from whole hours.
    pub const fn from_hours(hours: u64) -> Self {
        Self {
            seconds: hours * 3600,
        }
    }

    /// Creates a duration from whole days.
    pub const fn from_days(days: u64) -> Self {
        Self {
            seconds: days * 86_400,
        }
    }

    /// The duration in whole seconds.
    pub const fn as_secs(&self) -> u64 {
        self.seconds
    }

    /// Returns true if this duration is zero.
    pub const fn is_zero(&self) -> bool {
        self.seconds == 0
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_secs(d.seconds)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(Duration::from_secs(90).as_secs(), 90);
        assert_eq!(Duration::from_minutes(2).as_secs(), 120);
        assert_eq!(Duration::from_hours(1).as_secs(), 3600);
        assert_eq!(Duration::from_days(1).as_secs(), 86_400);
    }

    #[test]
    fn test_into_std_duration() {
        let std: std::time::Duration = Duration::from_secs(5).into();
        assert_eq!(std, std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_display() {
        assert_eq!(Duration::from_minutes(1).to_string(), "60s");
    }
}
