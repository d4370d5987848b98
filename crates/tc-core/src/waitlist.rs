//! Waitlist queues: priority first, then first come, first served.
//!
//! A queue is identified by teacher plus target. Only `waiting` entries hold a
//! place; `notified` entries have been offered the slot and sit outside the
//! ordering until they are fulfilled, removed or expire.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::time_range::TimeRange;
use crate::types::{ValidationError, WaitlistStatus};

/// Lifetime of a fresh entry.
pub const JOIN_EXPIRY: Duration = Duration::days(7);

/// How long a notified student has to respond.
pub const NOTIFY_EXPIRY: Duration = Duration::hours(24);

pub const MAX_EXTEND_HOURS: i64 = 168;

/// What the student is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistTarget {
    /// A specific dated slot.
    Slot { slot_id: String },
    /// A weekly day and time window.
    Window { day_of_week: Weekday, time: TimeRange },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: String,
    pub teacher_id: String,
    pub student_id: String,
    pub target: WaitlistTarget,
    pub status: WaitlistStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
}

impl WaitlistEntry {
    pub fn same_queue(&self, other: &Self) -> bool {
        self.teacher_id == other.teacher_id && self.target == other.target
    }

    /// Whether the expiry sweep should close this entry at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, WaitlistStatus::Waiting | WaitlistStatus::Notified)
            && self.expires_at <= now
    }
}

/// Queue order: higher priority, then earlier `created_at`, then id.
pub fn queue_order(a: &WaitlistEntry, b: &WaitlistEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// 1-based position of `entry` among the `waiting` entries of its queue.
///
/// `entries` may contain other queues and other statuses; they are ignored.
pub fn queue_position(entry: &WaitlistEntry, entries: &[WaitlistEntry]) -> usize {
    1 + entries
        .iter()
        .filter(|other| {
            other.id != entry.id
                && other.status == WaitlistStatus::Waiting
                && other.same_queue(entry)
                && queue_order(other, entry) == Ordering::Less
        })
        .count()
}

/// Head of the queue, if anyone is waiting.
pub fn next_in_queue(entries: &[WaitlistEntry]) -> Option<&WaitlistEntry> {
    entries
        .iter()
        .filter(|e| e.status == WaitlistStatus::Waiting)
        .min_by(|a, b| queue_order(a, b))
}

/// Caller-driven entry changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum WaitlistAction {
    Notify,
    Fulfill,
    Remove,
    Extend { hours: i64 },
}

impl WaitlistAction {
    /// Parses the action name; `extend` needs `hours`.
    pub fn parse(action: &str, hours: Option<i64>) -> Result<Self, ValidationError> {
        match action {
            "notify" => Ok(Self::Notify),
            "fulfill" => Ok(Self::Fulfill),
            "remove" => Ok(Self::Remove),
            "extend" => {
                let hours = hours.ok_or(ValidationError::Empty { field: "hours" })?;
                validate_extend_hours(hours)?;
                Ok(Self::Extend { hours })
            }
            other => Err(ValidationError::InvalidValue {
                field: "waitlist action",
                value: other.to_string(),
            }),
        }
    }
}

pub fn validate_extend_hours(hours: i64) -> Result<i64, ValidationError> {
    if !(1..=MAX_EXTEND_HOURS).contains(&hours) {
        return Err(ValidationError::OutOfRange {
            field: "hours",
            message: format!("expected 1..={MAX_EXTEND_HOURS}, got {hours}"),
        });
    }
    Ok(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, priority: i32, minute: u32) -> WaitlistEntry {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 9, minute, 0).unwrap();
        WaitlistEntry {
            id: id.to_string(),
            teacher_id: "t-1".to_string(),
            student_id: format!("student-{id}"),
            target: WaitlistTarget::Window {
                day_of_week: Weekday::Mon,
                time: TimeRange::parse("16:00", "17:00").unwrap(),
            },
            status: WaitlistStatus::Waiting,
            priority,
            created_at,
            expires_at: created_at + JOIN_EXPIRY,
            notified_at: None,
        }
    }

    #[test]
    fn earlier_entries_rank_ahead_at_equal_priority() {
        let entries = vec![entry("a", 0, 0), entry("b", 0, 5), entry("c", 0, 10)];
        let positions: Vec<usize> = entries.iter().map(|e| queue_position(e, &entries)).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn priority_beats_arrival() {
        let entries = vec![entry("a", 0, 0), entry("b", 5, 30)];
        assert_eq!(queue_position(&entries[1], &entries), 1);
        assert_eq!(queue_position(&entries[0], &entries), 2);
        assert_eq!(next_in_queue(&entries).unwrap().id, "b");
    }

    #[test]
    fn promotion_shifts_everyone_behind() {
        let mut entries = vec![entry("a", 0, 0), entry("b", 0, 5), entry("c", 0, 10)];
        entries[0].status = WaitlistStatus::Notified;
        assert_eq!(queue_position(&entries[1], &entries), 1);
        assert_eq!(queue_position(&entries[2], &entries), 2);
        assert_eq!(next_in_queue(&entries).unwrap().id, "b");
    }

    #[test]
    fn other_queues_do_not_count() {
        let mut other = entry("x", 9, 0);
        other.target = WaitlistTarget::Slot {
            slot_id: "slot-1".to_string(),
        };
        let mine = entry("a", 0, 5);
        assert_eq!(queue_position(&mine, &[other, mine.clone()]), 1);
    }

    #[test]
    fn overdue_only_for_open_entries() {
        let mut e = entry("a", 0, 0);
        let later = e.expires_at + Duration::seconds(1);
        assert!(e.is_overdue(later));
        assert!(!e.is_overdue(e.created_at));
        e.status = WaitlistStatus::Fulfilled;
        assert!(!e.is_overdue(later));
    }

    #[test]
    fn extend_hours_are_bounded() {
        assert_eq!(WaitlistAction::parse("extend", Some(168)).unwrap(), WaitlistAction::Extend { hours: 168 });
        assert!(WaitlistAction::parse("extend", Some(169)).is_err());
        assert!(WaitlistAction::parse("extend", Some(0)).is_err());
        assert!(WaitlistAction::parse("extend", None).is_err());
        assert!(WaitlistAction::parse("promote", None).is_err());
    }
}
