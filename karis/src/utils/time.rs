use chrono::{DateTime, Local, Timelike};
use serde::{Serialize, Serializer};
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Format used for timestamps written to the result files,
/// local time with microseconds and no offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Coarse label for the time of day a result was taken. Latency
/// on the farm network varies with load over the day so results
/// are grouped by these periods during analysis.
#[derive(
    EnumString, IntoStaticStr, Display, Serialize, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    /// 05:00 until midday.
    Morning,
    /// Midday until 18:00.
    Afternoon,
    /// Everything else, including the early hours.
    Evening,
}

impl TimePeriod {
    /// Period for an hour of the day in [0 - 23].
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimePeriod::Morning,
            12..=17 => TimePeriod::Afternoon,
            _ => TimePeriod::Evening,
        }
    }

    /// Period for a local timestamp.
    pub fn of(time: &DateTime<Local>) -> Self {
        Self::from_hour(time.hour())
    }
}

/// A point in time captured both on the monotonic clock, used to
/// measure latency, and on the wall clock, used for reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timestamp {
    /// Monotonic instant for measuring elapsed time.
    pub instant: Instant,
    /// Local wall clock time for the logs.
    pub wall: DateTime<Local>,
}

impl Timestamp {
    /// Capture the current time.
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Local::now(),
        }
    }

    /// The same timestamp moved forward by `offset` on both clocks.
    ///
    /// * `offset`: duration to add.
    pub fn offset(&self, offset: Duration) -> Self {
        Self {
            instant: self.instant + offset,
            wall: self.wall
                + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Milliseconds elapsed since `earlier`, rounded to two decimal places.
    /// Saturates at zero if `earlier` is in the future.
    pub fn millis_since(&self, earlier: &Timestamp) -> f64 {
        let elapsed = self.instant.saturating_duration_since(earlier.instant);
        (elapsed.as_micros() as f64 / 10.0).round() / 100.0
    }
}

/// Serialise a local timestamp with [`TIMESTAMP_FORMAT`].
///
/// * `value`: timestamp to write.
/// * `serializer`: Serializer
pub fn local_timestamp<S>(value: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case(0, TimePeriod::Evening)]
    #[case(4, TimePeriod::Evening)]
    #[case(5, TimePeriod::Morning)]
    #[case(11, TimePeriod::Morning)]
    #[case(12, TimePeriod::Afternoon)]
    #[case(17, TimePeriod::Afternoon)]
    #[case(18, TimePeriod::Evening)]
    #[case(23, TimePeriod::Evening)]
    fn test_period_from_hour(#[case] hour: u32, #[case] expected: TimePeriod) {
        assert_eq!(TimePeriod::from_hour(hour), expected);
    }

    #[rstest]
    #[case(TimePeriod::Morning, "morning")]
    #[case(TimePeriod::Afternoon, "afternoon")]
    #[case(TimePeriod::Evening, "evening")]
    fn test_period_labels(#[case] period: TimePeriod, #[case] label: &str) {
        assert_eq!(period.to_string(), label);
        assert_eq!(TimePeriod::from_str(label).unwrap(), period);
    }

    #[test]
    fn test_period_of_local_time() {
        let time = Local.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        assert_eq!(TimePeriod::of(&time), TimePeriod::Afternoon);
    }

    #[test]
    fn test_millis_since() {
        let start = Timestamp::now();
        let later = start.offset(Duration::from_micros(50_126));
        assert_eq!(later.millis_since(&start), 50.13);
        assert_eq!(start.millis_since(&later), 0.0);
        assert_eq!(
            (later.wall - start.wall).num_microseconds(),
            Some(50_126),
            "Both clocks should move together"
        );
    }
}
