//! # Scheduler Profiles
//!
//! A profile maps the local hour of day to the time until the next
//! measurement. Profiles are selected by index, most frequent first.

use std::fmt;

use crate::error::SchedulerConfigError;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulerProfile {
    VeryHigh,
    High,
    #[default]
    Medium,
    Low,
    VeryLow,
    /// Debug profile.
    EveryMinute,
}

impl SchedulerProfile {
    pub const ALL: [SchedulerProfile; 6] = [
        SchedulerProfile::VeryHigh,
        SchedulerProfile::High,
        SchedulerProfile::Medium,
        SchedulerProfile::Low,
        SchedulerProfile::VeryLow,
        SchedulerProfile::EveryMinute,
    ];

    pub const DEFAULT_INDEX: i64 = 2;

    /// Profile used when the configured index names no profile.
    pub const FALLBACK: SchedulerProfile = Self::ALL[Self::ALL.len() / 2];

    /// Look up a profile by configuration index.
    ///
    /// Indices past the end fall back to [`Self::FALLBACK`]; negative
    /// indices are rejected.
    pub fn from_index(index: i64) -> Result<Self, SchedulerConfigError> {
        if index < 0 {
            return Err(SchedulerConfigError::ProfileIndex(index));
        }
        match Self::ALL.get(index as usize) {
            Some(profile) => Ok(*profile),
            None => {
                tracing::error!(
                    index,
                    fallback = %Self::FALLBACK,
                    "unknown scheduler profile index"
                );
                Ok(Self::FALLBACK)
            }
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SchedulerProfile::VeryHigh => "Very high",
            SchedulerProfile::High => "High",
            SchedulerProfile::Medium => "Medium",
            SchedulerProfile::Low => "Low",
            SchedulerProfile::VeryLow => "Very low",
            SchedulerProfile::EveryMinute => "Every minute",
        }
    }

    /// Nominal number of sessions per day.
    pub fn daily_measurements(self) -> u32 {
        match self {
            SchedulerProfile::VeryHigh => 12 * 3 + 3 * 2 + 12,
            SchedulerProfile::High => 16 * 2 + 12,
            SchedulerProfile::Medium => 12 * 2 + 4 + 4,
            SchedulerProfile::Low => 12 + 4,
            SchedulerProfile::VeryLow => 8 + 3,
            SchedulerProfile::EveryMinute => 24 * 60,
        }
    }

    /// Milliseconds until the next measurement, given the local hour (0-23).
    pub fn interval_ms(self, hour: u32) -> u64 {
        let day = (8..=20).contains(&hour);
        let evening = (21..=24).contains(&hour);
        match self {
            SchedulerProfile::VeryHigh if day => 20 * MINUTE_MS,
            SchedulerProfile::VeryHigh if evening => 30 * MINUTE_MS,
            SchedulerProfile::VeryHigh => 2 * HOUR_MS,
            SchedulerProfile::High if day || evening => 30 * MINUTE_MS,
            SchedulerProfile::High => 2 * HOUR_MS,
            SchedulerProfile::Medium if day => 30 * MINUTE_MS,
            SchedulerProfile::Medium if evening => HOUR_MS,
            SchedulerProfile::Medium => 2 * HOUR_MS,
            SchedulerProfile::Low if day => HOUR_MS,
            SchedulerProfile::Low => 3 * HOUR_MS,
            SchedulerProfile::VeryLow if day => 90 * MINUTE_MS,
            SchedulerProfile::VeryLow => 4 * HOUR_MS,
            SchedulerProfile::EveryMinute => MINUTE_MS,
        }
    }
}

impl fmt::Display for SchedulerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_profile_intervals() {
        let p = SchedulerProfile::Medium;
        assert_eq!(p.interval_ms(10), 30 * 60 * 1000);
        assert_eq!(p.interval_ms(8), 30 * 60 * 1000);
        assert_eq!(p.interval_ms(20), 30 * 60 * 1000);
        assert_eq!(p.interval_ms(21), 60 * 60 * 1000);
        assert_eq!(p.interval_ms(23), 60 * 60 * 1000);
        assert_eq!(p.interval_ms(0), 2 * 60 * 60 * 1000);
        assert_eq!(p.interval_ms(7), 2 * 60 * 60 * 1000);
    }

    #[test]
    fn high_profile_covers_evening_with_day_rate() {
        assert_eq!(SchedulerProfile::High.interval_ms(22), 30 * 60 * 1000);
        assert_eq!(SchedulerProfile::High.interval_ms(3), 2 * 60 * 60 * 1000);
    }

    #[test]
    fn every_minute_ignores_hour() {
        for hour in 0..24 {
            assert_eq!(SchedulerProfile::EveryMinute.interval_ms(hour), 60_000);
        }
    }

    #[test]
    fn index_lookup() {
        assert_eq!(
            SchedulerProfile::from_index(SchedulerProfile::DEFAULT_INDEX).unwrap(),
            SchedulerProfile::Medium
        );
        assert_eq!(SchedulerProfile::from_index(0).unwrap(), SchedulerProfile::VeryHigh);
        assert_eq!(SchedulerProfile::from_index(5).unwrap(), SchedulerProfile::EveryMinute);
        assert_eq!(SchedulerProfile::from_index(6).unwrap(), SchedulerProfile::Low);
        assert_eq!(SchedulerProfile::from_index(99).unwrap(), SchedulerProfile::FALLBACK);
        assert_eq!(
            SchedulerProfile::from_index(-1).unwrap_err(),
            SchedulerConfigError::ProfileIndex(-1)
        );
    }

    #[test]
    fn index_roundtrip() {
        for (i, p) in SchedulerProfile::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn daily_counts() {
        assert_eq!(SchedulerProfile::VeryHigh.daily_measurements(), 54);
        assert_eq!(SchedulerProfile::Medium.daily_measurements(), 32);
        assert_eq!(SchedulerProfile::VeryLow.daily_measurements(), 11);
    }
}
