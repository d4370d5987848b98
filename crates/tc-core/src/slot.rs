//! Bookable slots, weekly templates and explicit blocks.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::time_range::TimeRange;
use crate::types::SlotStatus;

/// A concrete, dated slot a student can book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub id: String,
    pub teacher_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub time: TimeRange,
    pub duration_minutes: i64,
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub is_recurring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Created through a forced override despite conflicts.
    pub is_override: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduleSlot {
    /// Slots that still occupy the teacher's time.
    pub fn blocks_time(&self) -> bool {
        matches!(self.status, SlotStatus::Available | SlotStatus::Booked)
    }

    pub fn weekday(&self) -> Weekday {
        self.date.weekday()
    }
}

/// A recurring weekly definition that materializes into dated slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotTemplate {
    pub id: String,
    pub teacher_id: String,
    pub day_of_week: Weekday,
    #[serde(flatten)]
    pub time: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub duration_minutes: i64,
    pub is_available: bool,
    pub is_recurring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// A range the teacher has marked unavailable, weekly or on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSlot {
    pub id: String,
    pub teacher_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Weekday>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(flatten)]
    pub time: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BlockedSlot {
    /// Whether the block applies on `date`.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.date == Some(date) || self.day_of_week == Some(date.weekday())
    }
}

/// Where a slot lives: a specific date or a weekday in the weekly template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotTarget {
    Date(NaiveDate),
    Weekly(Weekday),
}

impl SlotTarget {
    pub fn weekday(&self) -> Weekday {
        match self {
            Self::Date(date) => date.weekday(),
            Self::Weekly(day) => *day,
        }
    }

    /// The target moved by `days`.
    #[must_use]
    pub fn shifted_days(&self, days: i64) -> Self {
        match self {
            Self::Date(date) => Self::Date(*date + chrono::Duration::days(days)),
            Self::Weekly(day) => {
                let mut shifted = *day;
                for _ in 0..days.unsigned_abs() {
                    shifted = if days < 0 { shifted.pred() } else { shifted.succ() };
                }
                Self::Weekly(shifted)
            }
        }
    }
}

/// A slot someone wants to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSlot {
    pub target: SlotTarget,
    #[serde(flatten)]
    pub time: TimeRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekly_target_wraps_around_the_week() {
        let sunday = SlotTarget::Weekly(Weekday::Sun);
        assert_eq!(sunday.shifted_days(1), SlotTarget::Weekly(Weekday::Mon));
        assert_eq!(sunday.shifted_days(-2), SlotTarget::Weekly(Weekday::Fri));
    }

    #[test]
    fn date_target_shifts_by_days() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            SlotTarget::Date(date).shifted_days(1),
            SlotTarget::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap())
        );
        assert_eq!(SlotTarget::Date(date).weekday(), Weekday::Wed);
    }

    #[test]
    fn block_applies_by_date_or_weekday() {
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let block = BlockedSlot {
            id: "b-1".to_string(),
            teacher_id: "t-1".to_string(),
            day_of_week: Some(Weekday::Mon),
            date: None,
            time: TimeRange::parse("12:00", "13:00").unwrap(),
            reason: Some("lunch".to_string()),
        };
        assert!(block.applies_on(monday));
        assert!(!block.applies_on(monday.succ_opt().unwrap()));
    }
}
