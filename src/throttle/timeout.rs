//! Timeout records: a penalty window persisted per identity.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A penalty that started at `start_time` and lasts `duration`.
///
/// The zero value (`duration == 0`) means no timeout has ever been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            start_time: DateTime::<Utc>::UNIX_EPOCH,
            duration: Duration::ZERO,
        }
    }
}

impl Timeout {
    /// A penalty starting at `start_time`.
    pub fn new(start_time: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            start_time,
            duration,
        }
    }

    /// Whether this is the zero value.
    pub fn is_empty(&self) -> bool {
        self.duration.is_zero()
    }

    /// When the penalty ends.
    pub fn end_time(&self) -> DateTime<Utc> {
        let delta = TimeDelta::from_std(self.duration).unwrap_or(TimeDelta::MAX);
        self.start_time
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the penalty is in effect at `now`. False from the end instant on.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.end_time()
    }

    /// Encode as `"{start_unix_nanos}:{duration_nanos}"`.
    pub fn encode(&self) -> String {
        let start = self.start_time.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let duration = i64::try_from(self.duration.as_nanos()).unwrap_or(i64::MAX);
        format!("{start}:{duration}")
    }

    /// Decode the form produced by [`Timeout::encode`].
    pub fn decode(value: &str) -> Result<Self, String> {
        let (start, duration) = value
            .split_once(':')
            .ok_or_else(|| format!("missing ':' separator in {value:?}"))?;

        let start: i64 = start
            .parse()
            .map_err(|e| format!("bad start time {start:?}: {e}"))?;
        let duration: i64 = duration
            .parse()
            .map_err(|e| format!("bad duration {duration:?}: {e}"))?;
        if duration < 0 {
            return Err(format!("negative duration {duration}"));
        }

        Ok(Self {
            start_time: DateTime::<Utc>::from_timestamp_nanos(start),
            duration: Duration::from_nanos(duration as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let start = DateTime::<Utc>::from_timestamp_nanos(1_700_000_000_123_456_789);
        let timeout = Timeout::new(start, Duration::from_secs(2));

        assert_eq!(timeout.encode(), "1700000000123456789:2000000000");
        assert_eq!(Timeout::decode(&timeout.encode()).unwrap(), timeout);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Timeout::decode("").is_err());
        assert!(Timeout::decode("123").is_err());
        assert!(Timeout::decode("abc:1").is_err());
        assert!(Timeout::decode("1:xyz").is_err());
        assert!(Timeout::decode("1:2:3").is_err());
        assert!(Timeout::decode("1:-5").is_err());
    }

    #[test]
    fn test_active_window_boundaries() {
        let start = Utc::now();
        let timeout = Timeout::new(start, Duration::from_secs(2));
        let end = start + TimeDelta::seconds(2);

        assert_eq!(timeout.end_time(), end);
        assert!(timeout.is_active_at(start));
        assert!(timeout.is_active_at(end - TimeDelta::nanoseconds(1)));
        assert!(!timeout.is_active_at(end));
        assert!(!timeout.is_active_at(end + TimeDelta::seconds(1)));
    }

    #[test]
    fn test_default_is_empty_and_inactive() {
        let timeout = Timeout::default();
        assert!(timeout.is_empty());
        assert!(!timeout.is_active_at(Utc::now()));
    }
}
