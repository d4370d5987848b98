//! Auto-detection policy.
//!
//! The detector infers class start and end from meeting-URL reachability. This
//! module holds the pure parts: confidence scoring, the per-enrollment gate,
//! the start/end decision, and the batch counters. Probing and persistence
//! live in the callers.
//!
//! # Decision Summary
//!
//! 1. Enrollments are grouped by normalised meeting URL so each meeting is
//!    probed once.
//! 2. Each probe yields a [`MeetingStatus`] with a [`Confidence`].
//! 3. Per enrollment: start when the meeting is reachable, the gate passes
//!    and no session is open; end when the meeting is unreachable and a
//!    session is open; otherwise skip with a reason.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::enrollment::{Enrollment, normalize_meeting_url};
use crate::session::{AUTO_SCHEDULE_TOLERANCE_MINUTES, within_class_hours};
use crate::time_range::Moment;
use crate::types::define_str_enum;

define_str_enum!(
    /// How sure the detector is about what a probe means.
    Confidence, "confidence" {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
);

/// Observed state of one meeting URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingStatus {
    pub is_accessible: bool,
    /// Secondary signal. The HTTP probe cannot see participants, so it always
    /// reports `false`; richer probes may set it.
    pub has_active_participants: bool,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Transport failure (timeout, DNS, TLS). Counts as inaccessible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeetingStatus {
    /// A status from the two signals, with confidence derived from them.
    pub fn observed(is_accessible: bool, has_active_participants: bool) -> Self {
        Self {
            is_accessible,
            has_active_participants,
            confidence: derive_confidence(is_accessible, has_active_participants),
            http_status: None,
            error: None,
        }
    }

    /// Status for a probe that could not complete.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::observed(false, false)
        }
    }

    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// A definite "no" from the server, as opposed to a transport failure.
    pub const fn is_definitely_unreachable(&self) -> bool {
        !self.is_accessible && self.error.is_none()
    }
}

/// Confidence for a pair of probe signals.
///
/// An unreachable meeting is confidently over; a reachable one is only
/// confidently live when the secondary signal agrees.
pub const fn derive_confidence(is_accessible: bool, has_active_participants: bool) -> Confidence {
    match (is_accessible, has_active_participants) {
        (false, _) | (true, true) => Confidence::High,
        (true, false) => Confidence::Medium,
    }
}

/// Why an enrollment produced no transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    OutsideHours,
    DailyCapReached { logged: u32, cap: u32 },
    OffSchedule,
    LowConfidence,
    AlreadyActive,
    MeetingNotActive,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutsideHours => f.write_str("outside hours"),
            Self::DailyCapReached { logged, cap } => {
                write!(f, "daily cap reached ({logged}/{cap})")
            }
            Self::OffSchedule => f.write_str("not near a scheduled class"),
            Self::LowConfidence => f.write_str("low confidence"),
            Self::AlreadyActive => f.write_str("already has active log"),
            Self::MeetingNotActive => f.write_str("meeting not active"),
        }
    }
}

/// What to do for one enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Start,
    End { session_id: String },
    Skip(SkipReason),
}

/// Whether a new session may be started for `enrollment` right now.
///
/// `sessions_today` counts every session already logged today for the pair.
pub fn should_process(
    enrollment: &Enrollment,
    status: &MeetingStatus,
    sessions_today: u32,
    now: &Moment,
) -> Result<(), SkipReason> {
    let time = now.local_time();
    if !within_class_hours(time) {
        return Err(SkipReason::OutsideHours);
    }
    let cap = enrollment.daily_session_cap();
    if sessions_today >= cap {
        return Err(SkipReason::DailyCapReached {
            logged: sessions_today,
            cap,
        });
    }
    if !enrollment.is_near_schedule(now.weekday(), time, AUTO_SCHEDULE_TOLERANCE_MINUTES) {
        return Err(SkipReason::OffSchedule);
    }
    if status.confidence == Confidence::Low {
        return Err(SkipReason::LowConfidence);
    }
    Ok(())
}

/// Decides the transition for one enrollment.
///
/// The gate only guards starts. An open session whose meeting has gone away
/// is always ended, even past the daily cap or outside hours, so it gets
/// settled promptly.
pub fn decide(
    enrollment: &Enrollment,
    status: &MeetingStatus,
    active_session_id: Option<&str>,
    sessions_today: u32,
    now: &Moment,
) -> Decision {
    if status.is_accessible {
        if active_session_id.is_some() {
            return Decision::Skip(SkipReason::AlreadyActive);
        }
        return match should_process(enrollment, status, sessions_today, now) {
            Ok(()) => Decision::Start,
            Err(reason) => Decision::Skip(reason),
        };
    }

    if status.confidence == Confidence::Low {
        return Decision::Skip(SkipReason::LowConfidence);
    }
    match active_session_id {
        Some(id) => Decision::End {
            session_id: id.to_string(),
        },
        None => Decision::Skip(SkipReason::MeetingNotActive),
    }
}

/// Groups watchable enrollments by normalised meeting URL.
///
/// Ordered by URL so batch runs are reproducible.
pub fn group_by_url(enrollments: Vec<Enrollment>) -> BTreeMap<String, Vec<Enrollment>> {
    let mut groups: BTreeMap<String, Vec<Enrollment>> = BTreeMap::new();
    for enrollment in enrollments {
        let Some(url) = enrollment.watched_url() else {
            continue;
        };
        let key = normalize_meeting_url(url);
        groups.entry(key).or_default().push(enrollment);
    }
    groups
}

/// Counters for one detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub checked: u32,
    pub started: u32,
    pub ended: u32,
    pub skipped: u32,
    pub errors: u32,
    pub cleaned_up: u32,
}

impl DetectionStats {
    /// Share of checked enrollments that produced a transition.
    pub fn efficiency(&self) -> f64 {
        ratio(self.started + self.ended, self.checked)
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.checked)
    }

    pub fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::Start => self.started += 1,
            Decision::End { .. } => self.ended += 1,
            Decision::Skip(_) => self.skipped += 1,
        }
    }
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        f64::from(numerator) / f64::from(denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::ScheduleEntry;
    use chrono::{NaiveTime, TimeZone, Utc, Weekday};

    fn monday_at(h: u32, m: u32) -> Moment {
        Moment::utc(Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap())
    }

    fn enrollment(url: &str, classes_per_week: u32) -> Enrollment {
        Enrollment {
            id: format!("enr-{url}"),
            teacher_id: "teacher-1".to_string(),
            student_id: "student-1".to_string(),
            student_email: None,
            meeting_url: Some(url.to_string()),
            classes_per_week,
            is_active: true,
            schedule: Vec::new(),
        }
    }

    #[test]
    fn confidence_follows_signals() {
        assert_eq!(derive_confidence(false, false), Confidence::High);
        assert_eq!(derive_confidence(true, true), Confidence::High);
        assert_eq!(derive_confidence(true, false), Confidence::Medium);
    }

    #[test]
    fn failed_probe_is_inaccessible_but_not_definite() {
        let status = MeetingStatus::failed("timed out");
        assert!(!status.is_accessible);
        assert!(!status.is_definitely_unreachable());
        assert!(MeetingStatus::observed(false, false).is_definitely_unreachable());
    }

    #[test]
    fn reachable_meeting_starts_session() {
        let e = enrollment("https://meet.example.com/a", 1);
        let status = MeetingStatus::observed(true, false);
        assert_eq!(decide(&e, &status, None, 0, &monday_at(16, 0)), Decision::Start);
    }

    #[test]
    fn reachable_meeting_with_open_session_is_skipped() {
        let e = enrollment("https://meet.example.com/a", 1);
        let status = MeetingStatus::observed(true, false);
        assert_eq!(
            decide(&e, &status, Some("s-1"), 1, &monday_at(16, 0)),
            Decision::Skip(SkipReason::AlreadyActive)
        );
    }

    #[test]
    fn unreachable_meeting_ends_open_session() {
        let e = enrollment("https://meet.example.com/a", 1);
        let status = MeetingStatus::observed(false, false);
        assert_eq!(
            decide(&e, &status, Some("s-1"), 5, &monday_at(23, 30)),
            Decision::End {
                session_id: "s-1".to_string()
            }
        );
        assert_eq!(
            decide(&e, &status, None, 0, &monday_at(16, 0)),
            Decision::Skip(SkipReason::MeetingNotActive)
        );
    }

    #[test]
    fn gate_enforces_hours_cap_schedule_and_confidence() {
        let mut e = enrollment("https://meet.example.com/a", 1);
        let status = MeetingStatus::observed(true, false);

        assert_eq!(
            should_process(&e, &status, 0, &monday_at(5, 59)),
            Err(SkipReason::OutsideHours)
        );
        assert_eq!(
            should_process(&e, &status, 2, &monday_at(12, 0)),
            Err(SkipReason::DailyCapReached { logged: 2, cap: 2 })
        );

        e.schedule.push(ScheduleEntry {
            day_of_week: Weekday::Mon,
            start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        });
        assert_eq!(should_process(&e, &status, 0, &monday_at(16, 55)), Ok(()));
        assert_eq!(
            should_process(&e, &status, 0, &monday_at(17, 5)),
            Err(SkipReason::OffSchedule)
        );

        let low = MeetingStatus {
            confidence: Confidence::Low,
            ..status
        };
        assert_eq!(
            should_process(&e, &low, 0, &monday_at(16, 0)),
            Err(SkipReason::LowConfidence)
        );
    }

    #[test]
    fn grouping_dedupes_urls_and_drops_blank_ones() {
        let a1 = enrollment("https://meet.example.com/A", 1);
        let mut a2 = enrollment("https://meet.example.com/a/", 1);
        a2.id = "enr-a2".to_string();
        let b = enrollment("https://meet.example.com/b", 1);
        let blank = enrollment("  ", 1);

        let groups = group_by_url(vec![a1, a2, b, blank]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["https://meet.example.com/a"].len(), 2);
        assert_eq!(groups["https://meet.example.com/b"].len(), 1);
    }

    #[test]
    fn stats_ratios_handle_empty_runs() {
        let mut stats = DetectionStats::default();
        assert!(stats.efficiency().abs() < f64::EPSILON);
        assert!(stats.error_rate().abs() < f64::EPSILON);

        stats.checked = 4;
        stats.record(&Decision::Start);
        stats.record(&Decision::Skip(SkipReason::OutsideHours));
        stats.errors = 1;
        assert!((stats.efficiency() - 0.25).abs() < f64::EPSILON);
        assert!((stats.error_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.skipped, 1);
    }
}
