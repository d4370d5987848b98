//! Teacher/student enrollments and their tentative weekly schedule.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// A student's enrollment with a teacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub teacher_id: String,
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_email: Option<String>,
    /// Registered meeting link; auto-detection only watches enrollments with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_url: Option<String>,
    pub classes_per_week: u32,
    pub is_active: bool,
    /// Tentative weekly schedule. Empty means "no schedule constraints".
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// One recurring class start on the tentative schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
}

impl Enrollment {
    /// The meeting URL, if it is set and non-blank.
    pub fn watched_url(&self) -> Option<&str> {
        self.meeting_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Whether `url` is the enrollment's registered meeting link.
    pub fn matches_url(&self, url: &str) -> bool {
        self.watched_url()
            .is_some_and(|registered| normalize_meeting_url(registered) == normalize_meeting_url(url))
    }

    /// Most sessions the auto-detector may log for this pair on one day.
    pub fn daily_session_cap(&self) -> u32 {
        self.classes_per_week.max(2)
    }

    /// Whether `time` on `day` is within `tolerance_minutes` of a scheduled
    /// start. Enrollments without a schedule accept any time.
    pub fn is_near_schedule(&self, day: Weekday, time: NaiveTime, tolerance_minutes: i64) -> bool {
        if self.schedule.is_empty() {
            return true;
        }
        self.schedule
            .iter()
            .filter(|entry| entry.day_of_week == day)
            .any(|entry| (time - entry.start_time).num_minutes().abs() <= tolerance_minutes)
    }
}

/// Canonical form used to compare and group meeting links.
///
/// Trims whitespace, drops a trailing slash and any fragment, and lowercases
/// the whole URL. Meeting providers treat their room codes case-insensitively.
pub fn normalize_meeting_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    without_fragment.trim_end_matches('/').to_ascii_lowercase()
}
