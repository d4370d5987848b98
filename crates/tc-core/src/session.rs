//! Class sessions and the rules around starting and ending them.
//!
//! A session is created `in_progress` and moves to `completed` exactly once.
//! Manual, extension and auto-detected starts share one transition; they only
//! differ in which validation checks they skip.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrollment::Enrollment;
use crate::time_range::{Moment, elapsed_minutes};
use crate::types::{PaymentStatus, SessionStatus, ValidationError, define_str_enum};

/// Earliest local time a class may start.
pub const CLASS_HOURS_START: NaiveTime = match NaiveTime::from_hms_opt(6, 0, 0) {
    Some(t) => t,
    None => panic!("valid constant"),
};

/// Latest local time a class may start.
pub const CLASS_HOURS_END: NaiveTime = match NaiveTime::from_hms_opt(23, 0, 0) {
    Some(t) => t,
    None => panic!("valid constant"),
};

/// Schedule tolerance for manual and extension starts.
pub const MANUAL_SCHEDULE_TOLERANCE_MINUTES: i64 = 30;

/// Schedule tolerance for auto-detected starts.
pub const AUTO_SCHEDULE_TOLERANCE_MINUTES: i64 = 60;

/// Auto-detected sessions still open after this long are closed by the sweep.
pub const AUTO_END_AFTER: Duration = Duration::hours(3);

/// Any session still open after this long is closed as an emergency.
pub const EMERGENCY_END_AFTER: Duration = Duration::hours(24);

/// Billable minutes for an emergency-closed session.
pub const EMERGENCY_DURATION_CAP_MINUTES: i64 = 180;

pub const AUTO_END_NOTE: &str = "[Auto-ended: exceeded 3 hours]";
pub const EMERGENCY_END_NOTE: &str = "[Emergency auto-end]";

define_str_enum!(
    /// Who asked for a session to start.
    StartSource, "start source" {
        Manual => "manual",
        /// The browser extension noticed the teacher joining the meeting.
        Extension => "extension",
        AutoDetect => "auto_detect",
    }
);

/// One taught class (a "class log").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: String,
    pub teacher_id: String,
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<String>,
    /// Local date the class was held on.
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    pub status: SessionStatus,
    pub detected_automatically: bool,
    /// Set once by settlement, never changed afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_deducted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    pub is_paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ClassSession {
    pub fn is_in_progress(&self) -> bool {
        self.status == SessionStatus::InProgress
    }

    /// Duration to bill: the stored value, or the span between start and end.
    pub fn billable_minutes(&self) -> Option<i64> {
        self.duration_minutes
            .or_else(|| self.end_time.map(|end| elapsed_minutes(self.start_time, end)))
    }
}

/// Optional fields supplied when a class ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndDetails {
    /// Caller-supplied end instant for out-of-band corrections.
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub topics: Option<String>,
    #[serde(default)]
    pub homework: Option<String>,
    /// Appended to the session notes.
    #[serde(default)]
    pub note: Option<String>,
}

/// Whether `time` falls inside the daily class window.
pub fn within_class_hours(time: NaiveTime) -> bool {
    (CLASS_HOURS_START..=CLASS_HOURS_END).contains(&time)
}

/// Checks a start request against the enrollment.
///
/// Manual overrides and the auto-detector skip every check here; the
/// auto-detector applies its own, wider gate before asking for a start.
pub fn validate_start(
    enrollment: &Enrollment,
    meeting_url: Option<&str>,
    source: StartSource,
    manual_override: bool,
    now: &Moment,
) -> Result<(), ValidationError> {
    if manual_override || source == StartSource::AutoDetect {
        return Ok(());
    }

    match meeting_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) if !enrollment.matches_url(url) => {
            return Err(ValidationError::MeetingUrlMismatch);
        }
        Some(_) => {}
        None if source == StartSource::Extension => {
            return Err(ValidationError::Empty {
                field: "meeting URL",
            });
        }
        None => {}
    }

    let time = now.local_time();
    if !within_class_hours(time) {
        return Err(ValidationError::OutsideClassHours { time });
    }
    if !enrollment.is_near_schedule(now.weekday(), time, MANUAL_SCHEDULE_TOLERANCE_MINUTES) {
        return Err(ValidationError::OutsideScheduleWindow {
            time,
            tolerance_minutes: MANUAL_SCHEDULE_TOLERANCE_MINUTES,
        });
    }
    Ok(())
}

/// End instant and rounded duration for closing `session`.
pub fn close_times(
    session: &ClassSession,
    end_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, i64), ValidationError> {
    let end = end_at.unwrap_or(now);
    if end < session.start_time {
        return Err(ValidationError::OutOfRange {
            field: "end time",
            message: format!(
                "{} is before the session start {}",
                end.to_rfc3339(),
                session.start_time.to_rfc3339()
            ),
        });
    }
    Ok((end, elapsed_minutes(session.start_time, end)))
}

/// Why the cleanup sweep closes a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Auto-detected and open longer than [`AUTO_END_AFTER`].
    AutoTimeout,
    /// Open longer than [`EMERGENCY_END_AFTER`], however it started.
    Emergency,
}

impl StaleReason {
    pub const fn note(self) -> &'static str {
        match self {
            Self::AutoTimeout => AUTO_END_NOTE,
            Self::Emergency => EMERGENCY_END_NOTE,
        }
    }
}

/// Decides whether the sweep should close `session`.
///
/// The emergency rule wins for sessions past 24 hours so that their billable
/// duration is capped.
pub fn classify_stale(session: &ClassSession, now: DateTime<Utc>) -> Option<StaleReason> {
    if !session.is_in_progress() {
        return None;
    }
    let age = now.signed_duration_since(session.start_time);
    if age > EMERGENCY_END_AFTER {
        Some(StaleReason::Emergency)
    } else if session.detected_automatically && age > AUTO_END_AFTER {
        Some(StaleReason::AutoTimeout)
    } else {
        None
    }
}

/// End instant and duration the sweep records for a stale session.
pub fn stale_close_times(
    session: &ClassSession,
    reason: StaleReason,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, i64) {
    let elapsed = elapsed_minutes(session.start_time, now);
    match reason {
        StaleReason::AutoTimeout => (now, elapsed),
        StaleReason::Emergency => {
            let capped = elapsed.min(EMERGENCY_DURATION_CAP_MINUTES);
            (session.start_time + Duration::minutes(capped), capped)
        }
    }
}

/// Appends `addition` to existing notes on a new line.
pub fn append_note(existing: Option<&str>, addition: &str) -> String {
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{existing}\n{addition}"),
        None => addition.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::ScheduleEntry;
    use chrono::{TimeZone, Weekday};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2024-01-01 is a Monday.
    fn monday_at(h: u32, m: u32) -> Moment {
        Moment::utc(Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap())
    }

    fn enrollment() -> Enrollment {
        Enrollment {
            id: "enr-1".to_string(),
            teacher_id: "teacher-1".to_string(),
            student_id: "student-1".to_string(),
            student_email: None,
            meeting_url: Some("https://meet.example.com/room-1".to_string()),
            classes_per_week: 2,
            is_active: true,
            schedule: vec![ScheduleEntry {
                day_of_week: Weekday::Mon,
                start_time: t(16, 0),
            }],
        }
    }

    fn session(start: DateTime<Utc>, auto: bool) -> ClassSession {
        ClassSession {
            id: "s-1".to_string(),
            teacher_id: "teacher-1".to_string(),
            student_id: "student-1".to_string(),
            enrollment_id: None,
            slot_id: None,
            date: start.date_naive(),
            start_time: start,
            end_time: None,
            duration_minutes: None,
            status: SessionStatus::InProgress,
            detected_automatically: auto,
            credits_deducted: None,
            payment_status: None,
            is_paid: false,
            content: None,
            topics: None,
            homework: None,
            notes: None,
            created_at: start,
        }
    }

    #[test]
    fn manual_start_near_schedule_is_accepted() {
        let result = validate_start(
            &enrollment(),
            Some("https://meet.example.com/room-1/"),
            StartSource::Manual,
            false,
            &monday_at(15, 45),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn manual_start_far_from_schedule_is_rejected() {
        let result = validate_start(
            &enrollment(),
            None,
            StartSource::Manual,
            false,
            &monday_at(17, 0),
        );
        assert!(matches!(
            result,
            Err(ValidationError::OutsideScheduleWindow {
                tolerance_minutes: 30,
                ..
            })
        ));
    }

    #[test]
    fn start_outside_class_hours_is_rejected() {
        let mut e = enrollment();
        e.schedule.clear();
        let result = validate_start(&e, None, StartSource::Manual, false, &monday_at(5, 30));
        assert!(matches!(
            result,
            Err(ValidationError::OutsideClassHours { .. })
        ));
    }

    #[test]
    fn mismatched_url_is_rejected() {
        let result = validate_start(
            &enrollment(),
            Some("https://meet.example.com/other"),
            StartSource::Extension,
            false,
            &monday_at(16, 0),
        );
        assert_eq!(result, Err(ValidationError::MeetingUrlMismatch));
    }

    #[test]
    fn extension_start_requires_url() {
        let result = validate_start(
            &enrollment(),
            None,
            StartSource::Extension,
            false,
            &monday_at(16, 0),
        );
        assert!(matches!(result, Err(ValidationError::Empty { .. })));
    }

    #[test]
    fn override_and_auto_detect_bypass_validation() {
        let late = monday_at(23, 30);
        let e = enrollment();
        assert!(validate_start(&e, Some("x"), StartSource::Manual, true, &late).is_ok());
        assert!(validate_start(&e, None, StartSource::AutoDetect, false, &late).is_ok());
    }

    #[test]
    fn close_times_rounds_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 16, 0, 0).unwrap();
        let s = session(start, false);
        let (end, minutes) = close_times(&s, None, start + Duration::seconds(3_629)).unwrap();
        assert_eq!(end, start + Duration::seconds(3_629));
        assert_eq!(minutes, 60);
        assert!(close_times(&s, Some(start - Duration::minutes(1)), start).is_err());
    }

    #[test]
    fn stale_classification_respects_thresholds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let auto = session(start, true);
        let manual = session(start, false);

        let just_under = start + Duration::minutes(179);
        assert_eq!(classify_stale(&auto, just_under), None);

        let over_three = start + Duration::minutes(181);
        assert_eq!(classify_stale(&auto, over_three), Some(StaleReason::AutoTimeout));
        assert_eq!(classify_stale(&manual, over_three), None);

        let over_day = start + Duration::hours(25);
        assert_eq!(classify_stale(&manual, over_day), Some(StaleReason::Emergency));
        assert_eq!(classify_stale(&auto, over_day), Some(StaleReason::Emergency));
    }

    #[test]
    fn stale_close_uses_elapsed_or_cap() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let s = session(start, true);
        let now = start + Duration::minutes(200);
        assert_eq!(
            stale_close_times(&s, StaleReason::AutoTimeout, now),
            (now, 200)
        );
        let later = start + Duration::hours(30);
        let (end, minutes) = stale_close_times(&s, StaleReason::Emergency, later);
        assert_eq!(minutes, EMERGENCY_DURATION_CAP_MINUTES);
        assert_eq!(end, start + Duration::minutes(EMERGENCY_DURATION_CAP_MINUTES));
    }

    #[test]
    fn append_note_joins_lines() {
        assert_eq!(append_note(None, "[x]"), "[x]");
        assert_eq!(append_note(Some("  "), "[x]"), "[x]");
        assert_eq!(append_note(Some("good class"), "[x]"), "good class\n[x]");
    }
}
