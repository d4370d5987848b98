//! Time-of-day ranges, overlap tests and the clock abstraction.
//!
//! All scheduling comparisons go through [`overlaps`], which treats ranges as
//! half-open: `09:00-10:00` and `10:00-11:00` touch but do not overlap.

use std::fmt;
use std::sync::LazyLock;

use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveTime, Offset, Timelike, Utc, Weekday,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// `H`, `HH`, `H:MM`, `HH:MM:SS`, each optionally followed by AM/PM.
static TIME_OF_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?::(\d{2}))?(?::(\d{2}))?\s*([AaPp])\.?[Mm]\.?$|^(\d{1,2})(?::(\d{2}))?(?::(\d{2}))?$")
        .expect("time-of-day pattern is valid")
});

/// Returns true when `[start_a, end_a)` and `[start_b, end_b)` intersect.
pub fn overlaps<T: PartialOrd>(start_a: T, end_a: T, start_b: T, end_b: T) -> bool {
    start_a < end_b && start_b < end_a
}

/// Parses a wall-clock time.
///
/// Accepts `14:30`, `14:30:00`, `2:30 PM`, `2pm`, `12 AM` and a bare hour
/// such as `9` or `17`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ValidationError> {
    let trimmed = value.trim();
    let invalid = || ValidationError::InvalidTime {
        value: value.to_string(),
    };
    let caps = TIME_OF_DAY_RE.captures(trimmed).ok_or_else(invalid)?;

    let (hour, minute, second, meridiem) = if caps.get(1).is_some() {
        (caps.get(1), caps.get(2), caps.get(3), caps.get(4))
    } else {
        (caps.get(5), caps.get(6), caps.get(7), None)
    };
    let number = |m: Option<regex::Match<'_>>| -> Result<u32, ValidationError> {
        m.map_or(Ok(0), |m| m.as_str().parse().map_err(|_| invalid()))
    };
    let mut hour = number(hour)?;
    let minute = number(minute)?;
    let second = number(second)?;

    if let Some(meridiem) = meridiem {
        if !(1..=12).contains(&hour) {
            return Err(invalid());
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("p");
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }

    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)
}

/// Formats a time of day the way it is stored: `HH:MM`.
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Whole minutes between two times of day on the same date.
pub fn duration_minutes(start: NaiveTime, end: NaiveTime) -> i64 {
    (end - start).num_minutes()
}

/// Minutes between two instants, rounded to the nearest minute.
///
/// Negative spans are clamped to zero.
pub fn elapsed_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let ms = end.signed_duration_since(start).num_milliseconds().max(0);
    (ms + 30_000).div_euclid(60_000)
}

/// Parses a weekday from a name (`Monday`, `mon`) or an index where
/// `0` is Sunday and `6` is Saturday.
pub fn parse_weekday(value: &str) -> Result<Weekday, ValidationError> {
    let trimmed = value.trim();
    if let Ok(index) = trimmed.parse::<u32>() {
        return weekday_from_index(index).ok_or_else(|| ValidationError::InvalidValue {
            field: "day of week",
            value: value.to_string(),
        });
    }
    trimmed
        .parse::<Weekday>()
        .map_err(|_| ValidationError::InvalidValue {
            field: "day of week",
            value: value.to_string(),
        })
}

/// Maps a Sunday-based index (0..=6) to a weekday.
pub const fn weekday_from_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Sunday-based index used for storage.
pub const fn weekday_index(day: Weekday) -> u32 {
    day.num_days_from_sunday()
}

/// A validated `[start, end)` range within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Creates a range, rejecting `start >= end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::InvalidRange {
                start: format_time(start),
                end: format_time(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parses both endpoints with [`parse_time_of_day`].
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn minutes(&self) -> i64 {
        duration_minutes(self.start, self.end)
    }

    /// Moves the range by `minutes`, or `None` if it would cross midnight.
    pub fn shifted(&self, minutes: i64) -> Option<Self> {
        let delta = Duration::minutes(minutes);
        let (start, start_wrap) = self.start.overflowing_add_signed(delta);
        let (end, end_wrap) = self.end.overflowing_add_signed(delta);
        if start_wrap != 0 || end_wrap != 0 || start >= end {
            return None;
        }
        Some(Self { start, end })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_time(self.start), format_time(self.end))
    }
}

/// "Now", as both a UTC instant and the caller's local wall clock.
///
/// Every time-dependent rule takes a `Moment` instead of reading the system
/// clock, so batch runs and tests can pin the instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub utc: DateTime<Utc>,
    pub offset: FixedOffset,
}

impl Moment {
    /// Reads the system clock and local timezone.
    pub fn now() -> Self {
        let local = Local::now();
        Self {
            utc: local.with_timezone(&Utc),
            offset: *local.offset(),
        }
    }

    pub const fn new(utc: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { utc, offset }
    }

    /// A moment whose local clock is UTC.
    pub fn utc(utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            offset: Utc.fix(),
        }
    }

    /// The same local offset at a different instant.
    #[must_use]
    pub const fn at(&self, utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            offset: self.offset,
        }
    }

    pub fn local_date(&self) -> NaiveDate {
        self.utc.with_timezone(&self.offset).date_naive()
    }

    pub fn local_time(&self) -> NaiveTime {
        let time = self.utc.with_timezone(&self.offset).time();
        // Sub-second precision never matters for schedule rules.
        time.with_nanosecond(0).unwrap_or(time)
    }

    pub fn weekday(&self) -> Weekday {
        use chrono::Datelike;
        self.local_date().weekday()
    }
}
