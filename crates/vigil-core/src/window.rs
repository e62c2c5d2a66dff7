//! Time windows, hourly buckets and monthly partition keys

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window; a reversed range is normalized to empty at `start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Window of `span` ending (exclusively) at `end`, clamped to the
    /// representable range
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        Self::new(saturating_sub(end, span), end)
    }

    /// Rolling window of the last `hours` hours ending at `end`
    pub fn last_hours(end: DateTime<Utc>, hours: i64) -> Self {
        match Duration::try_hours(hours) {
            Some(span) => Self::trailing(end, span),
            None if hours > 0 => Self::before(end),
            None => Self::new(end, end),
        }
    }

    /// Rolling window of the last `minutes` minutes ending at `end`
    pub fn last_minutes(end: DateTime<Utc>, minutes: i64) -> Self {
        match Duration::try_minutes(minutes) {
            Some(span) => Self::trailing(end, span),
            None if minutes > 0 => Self::before(end),
            None => Self::new(end, end),
        }
    }

    /// Everything strictly before `cutoff`
    pub fn before(cutoff: DateTime<Utc>) -> Self {
        Self::new(DateTime::<Utc>::MIN_UTC, cutoff)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// Inclusive range of monthly partitions overlapping this window,
    /// `None` when the window is empty
    pub fn partition_range(&self) -> Option<RangeInclusive<PartitionKey>> {
        if self.is_empty() {
            return None;
        }
        let first = PartitionKey::from_timestamp(self.start);
        let last = PartitionKey::from_timestamp(self.end - Duration::nanoseconds(1));
        Some(first..=last)
    }
}

/// `ts - span`, saturating at the earliest or latest representable instant
pub fn saturating_sub(ts: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    match ts.checked_sub_signed(span) {
        Some(t) => t,
        None if span > Duration::zero() => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// `ts` moved back by `days` whole days, saturating like [`saturating_sub`]
pub fn days_before(ts: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    match Duration::try_days(days) {
        Some(span) => saturating_sub(ts, span),
        None if days > 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Truncate a timestamp to the start of its hour
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(3600) * 3600;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

/// Calendar month a record is stored under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month: month.clamp(1, 12),
        }
    }

    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self::new(ts.year(), ts.month())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }

    /// First instant of the month
    pub fn start(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// First instant of the following month
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    /// Parse the `yYYYYmMM` suffix used in partition file names
    pub fn parse_suffix(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('y')?;
        let (year, month) = rest.split_once('m')?;
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self::new(year, month))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "y{:04}m{:02}", self.year, self.month)
    }
}
