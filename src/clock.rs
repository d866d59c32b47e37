use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::ops::{Deref, Neg};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Time source for poll and retry loops. Production code uses [`SystemClock`];
/// tests drive a manual clock so bounded retries can be exercised without real sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

/// A duration parsed from a human-readable string such as `4s` or `55d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDuration {
    inner: Duration,
}

impl From<Duration> for ParsedDuration {
    fn from(inner: Duration) -> Self {
        ParsedDuration { inner }
    }
}

impl From<u64> for ParsedDuration {
    fn from(seconds: u64) -> Self {
        Duration::from_secs(seconds).into()
    }
}

impl Deref for ParsedDuration {
    type Target = Duration;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for ParsedDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(ParsedDuration::from)
    }
}

impl Display for ParsedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_compact(**self))
    }
}

impl Serialize for ParsedDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Compact `55d 4h 2s` formatting. The output parses back with [`parse_duration`],
/// which is what makes it suitable for configuration round-trips.
fn format_compact(duration: Duration) -> String {
    const SECONDS_IN_MINUTE: u64 = 60;
    const SECONDS_IN_HOUR: u64 = 3600;
    const SECONDS_IN_DAY: u64 = 86400;

    let mut remaining = duration.as_secs();
    let days = remaining / SECONDS_IN_DAY;
    remaining %= SECONDS_IN_DAY;
    let hours = remaining / SECONDS_IN_HOUR;
    remaining %= SECONDS_IN_HOUR;
    let minutes = remaining / SECONDS_IN_MINUTE;
    let seconds = remaining % SECONDS_IN_MINUTE;

    let mut components = Vec::new();
    if days > 0 {
        components.push(format!("{days}d"));
    }
    if hours > 0 {
        components.push(format!("{hours}h"));
    }
    if minutes > 0 {
        components.push(format!("{minutes}m"));
    }
    if seconds > 0 || components.is_empty() {
        components.push(format!("{seconds}s"));
    }
    components.join(" ")
}

pub fn humanize_duration_core(
    duration: core::time::Duration,
) -> Result<String, time::error::ConversionRange> {
    Ok(humanize_duration(duration.try_into()?))
}

pub fn humanize_duration(mut duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;
    const SECONDS_IN_MONTH: i64 = 2_630_016; // Approximation (30.44 days)
    const SECONDS_IN_YEAR: i64 = 31_557_600; // Approximation (365.25 days)

    if duration.is_negative() {
        duration = duration.neg();
    }

    let mut remaining_seconds = duration.whole_seconds();

    let years = remaining_seconds / SECONDS_IN_YEAR;
    remaining_seconds %= SECONDS_IN_YEAR;
    let months = remaining_seconds / SECONDS_IN_MONTH;
    remaining_seconds %= SECONDS_IN_MONTH;
    let days = remaining_seconds / SECONDS_IN_DAY;
    remaining_seconds %= SECONDS_IN_DAY;
    let hours = remaining_seconds / SECONDS_IN_HOUR;
    remaining_seconds %= SECONDS_IN_HOUR;
    let minutes = remaining_seconds / SECONDS_IN_MINUTE;
    remaining_seconds %= SECONDS_IN_MINUTE;
    let seconds = remaining_seconds;

    let mut components = Vec::new();
    if years > 0 {
        components.push(format!(
            "{} year{}",
            years,
            if years > 1 { "s" } else { "" }
        ));
    }
    if months > 0 {
        components.push(format!(
            "{} month{}",
            months,
            if months > 1 { "s" } else { "" }
        ));
    }
    if days > 0 {
        components.push(format!("{} day{}", days, if days > 1 { "s" } else { "" }));
    }
    if hours > 0 {
        components.push(format!(
            "{} hour{}",
            hours,
            if hours > 1 { "s" } else { "" }
        ));
    }
    if minutes > 0 {
        components.push(format!(
            "{} minute{}",
            minutes,
            if minutes > 1 { "s" } else { "" }
        ));
    }
    if seconds > 0 || components.is_empty() {
        components.push(format!(
            "{} second{}",
            seconds,
            if seconds == 1 { "" } else { "s" }
        ));
    }

    components.join(", ")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use time::OffsetDateTime;

    /// Clock that advances instantly on sleep and records every sleep request.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<OffsetDateTime>,
        pub sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn starting_at(now: OffsetDateTime) -> Self {
            Self {
                now: Mutex::new(now),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub fn sleep_count(&self) -> usize {
            self.sleeps.lock().len()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> OffsetDateTime {
            *self.now.lock()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
            let mut now = self.now.lock();
            *now += duration;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::ZERO, "0s")]
    #[case(Duration::from_secs(4), "4s")]
    #[case(Duration::from_secs(90), "1m 30s")]
    #[case(Duration::from_secs(3600), "1h")]
    #[case(Duration::from_secs(86400 * 55), "55d")]
    #[case(Duration::from_secs(86400 + 3600 * 2 + 5), "1d 2h 5s")]
    fn test_format_compact_roundtrip(#[case] duration: Duration, #[case] expected: &str) {
        let formatted = format_compact(duration);
        assert_eq!(formatted, expected);
        let parsed: ParsedDuration = formatted.parse().unwrap();
        assert_eq!(*parsed, duration);
    }

    #[rstest]
    #[case(time::Duration::ZERO, "0 seconds")]
    #[case(time::Duration::seconds(61), "1 minute, 1 second")]
    #[case(time::Duration::seconds(60 * 60 * 24), "1 day")]
    fn test_humanize_duration(#[case] test_value: time::Duration, #[case] expected: &str) {
        let humanized = humanize_duration(test_value);
        assert_eq!(humanized, expected);
    }
}
