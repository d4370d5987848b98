//! Shared utilities for CLI commands.

use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tc_core::conflict::SlotConflicts;
use tc_core::time_range::{parse_time_of_day, parse_weekday};
use tc_core::{CandidateSlot, ScheduleEntry, SlotTarget, TimeRange, WaitlistTarget};

use crate::{PlacementArgs, WaitTargetArgs};

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(minute|hour|day)s?\s+ago$").expect("relative time pattern is valid")
});

/// Corrections further back than this are typos, not late log entries.
const MAX_RELATIVE_MINUTES: i64 = 7 * 24 * 60;

/// Parse a datetime string as either RFC 3339 or relative time.
///
/// Supports:
/// - RFC 3339: "2026-01-15T10:30:00Z"
/// - Relative: "2 hours ago", "30 minutes ago", "1 day ago"
pub fn parse_datetime(s: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s.trim()) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use RFC 3339 (e.g., 2026-01-15T10:30:00Z) or relative (e.g., '30 minutes ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;
    let minutes_per_unit = match &caps[2] {
        "minute" => 1,
        "hour" => 60,
        "day" => 60 * 24,
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };
    let minutes = n.saturating_mul(minutes_per_unit);
    if minutes > MAX_RELATIVE_MINUTES {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }
    Ok(now - Duration::minutes(minutes))
}

/// The candidate named by `--date`/`--day` and `--start`/`--end`.
pub fn candidate(placement: &PlacementArgs) -> anyhow::Result<CandidateSlot> {
    let target = match (placement.date, placement.day.as_deref()) {
        (Some(date), _) => SlotTarget::Date(date),
        (None, Some(day)) => SlotTarget::Weekly(parse_weekday(day)?),
        (None, None) => anyhow::bail!("either --date or --day is required"),
    };
    Ok(CandidateSlot {
        target,
        time: TimeRange::parse(&placement.start, &placement.end)?,
    })
}

/// The waitlist target named by `--slot` or `--day`/`--start`/`--end`.
pub fn wait_target(args: &WaitTargetArgs) -> anyhow::Result<WaitlistTarget> {
    if let Some(slot_id) = &args.slot {
        return Ok(WaitlistTarget::Slot {
            slot_id: slot_id.clone(),
        });
    }
    let (Some(day), Some(start), Some(end)) = (&args.day, &args.start, &args.end) else {
        anyhow::bail!("either --slot or --day with --start and --end is required");
    };
    Ok(WaitlistTarget::Window {
        day_of_week: parse_weekday(day)?,
        time: TimeRange::parse(start, end)?,
    })
}

/// Parses a tentative schedule entry such as `mon@16:00`.
pub fn parse_schedule_entry(value: &str) -> anyhow::Result<ScheduleEntry> {
    let Some((day, time)) = value.split_once('@') else {
        anyhow::bail!("Invalid schedule entry: {value}. Use DAY@TIME (e.g., mon@16:00)");
    };
    Ok(ScheduleEntry {
        day_of_week: parse_weekday(day)?,
        start_time: parse_time_of_day(time)?,
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Writes `value` as pretty JSON followed by a newline.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    writeln!(writer, "{json}")?;
    Ok(())
}

/// Writes the conflicts that blocked a write, then fails.
pub fn report_conflicts<W: Write>(writer: &mut W, conflicts: &[SlotConflicts]) -> anyhow::Result<()> {
    write_json(writer, &conflicts)?;
    anyhow::bail!(
        "{} candidate(s) conflict with the existing schedule",
        conflicts.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Weekday};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_rfc3339() {
        let parsed = parse_datetime("2026-03-02T09:30:00+02:00", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap());
    }

    #[test]
    fn parses_relative_time() {
        assert_eq!(
            parse_datetime("30 minutes ago", now()).unwrap(),
            now() - Duration::minutes(30)
        );
        assert_eq!(
            parse_datetime("1 hour ago", now()).unwrap(),
            now() - Duration::hours(1)
        );
    }

    #[test]
    fn rejects_garbage_and_huge_offsets() {
        assert!(parse_datetime("yesterday-ish", now()).is_err());
        assert!(parse_datetime("30 days ago", now()).is_err());
    }

    #[test]
    fn placement_prefers_date() {
        let placement = PlacementArgs {
            date: Some(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()),
            day: None,
            start: "10:00".to_string(),
            end: "11:00".to_string(),
        };
        let candidate = candidate(&placement).unwrap();
        assert_eq!(
            candidate.target,
            SlotTarget::Date(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
        );
        assert_eq!(candidate.time.minutes(), 60);

        let weekly = PlacementArgs {
            date: None,
            day: Some("wed".to_string()),
            ..placement
        };
        assert_eq!(candidate_target(&weekly), SlotTarget::Weekly(Weekday::Wed));
    }

    fn candidate_target(placement: &PlacementArgs) -> SlotTarget {
        candidate(placement).unwrap().target
    }

    #[test]
    fn wait_target_needs_slot_or_window() {
        let slot = WaitTargetArgs {
            slot: Some("slot-1".to_string()),
            day: None,
            start: None,
            end: None,
        };
        assert_eq!(
            wait_target(&slot).unwrap(),
            WaitlistTarget::Slot {
                slot_id: "slot-1".to_string()
            }
        );

        let partial = WaitTargetArgs {
            slot: None,
            day: Some("fri".to_string()),
            start: Some("16:00".to_string()),
            end: None,
        };
        assert!(wait_target(&partial).is_err());
    }

    #[test]
    fn schedule_entry_parses_day_and_time() {
        let entry = parse_schedule_entry("mon@4pm").unwrap();
        assert_eq!(entry.day_of_week, Weekday::Mon);
        assert_eq!(entry.start_time, NaiveTime::from_hms_opt(16, 0, 0).unwrap());
        assert!(parse_schedule_entry("monday").is_err());
    }
}
