//! Auto-detection run and stale-session cleanup.
//!
//! A run probes every watched meeting URL once, concurrently, then applies
//! the start/end decisions synchronously against the database. The probe
//! phase never touches the database, so no connection is held across an
//! await point.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tc_core::detection::{decide, group_by_url};
use tc_core::notify::log_delivery;
use tc_core::{
    Decision, DetectionStats, EndDetails, Enrollment, MeetingStatus, Moment, Notifier, StartSource,
};
use tc_db::{CleanedSession, Database, DbError, StartRequest, StudentRef};
use tc_probe::{HttpProbe, MeetingActivityProbe};
use tracing::{debug, info, warn};

use super::util::write_json;
use crate::Config;

/// Note appended when a class is closed because its meeting went away.
const DETECTED_END_NOTE: &str = "[Auto-detected: meeting ended]";

/// What happened to one enrollment during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub teacher_id: String,
    pub student_id: String,
    pub meeting_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    #[serde(flatten)]
    pub stats: DetectionStats,
    pub efficiency: f64,
    pub error_rate: f64,
    pub outcomes: Vec<Outcome>,
    pub cleaned: Vec<CleanedSession>,
}

/// Probes each `key -> url` target with at most `concurrency` requests in
/// flight.
pub async fn probe_all(
    probe: &dyn MeetingActivityProbe,
    targets: &BTreeMap<String, String>,
    concurrency: usize,
) -> BTreeMap<String, MeetingStatus> {
    stream::iter(targets)
        .map(|(key, url)| async move { (key.clone(), probe.probe(url).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

fn process(
    db: &mut Database,
    enrollment: &Enrollment,
    status: &MeetingStatus,
    now: &Moment,
    notifier: &dyn Notifier,
) -> Result<Decision, DbError> {
    let today = now.local_date();
    let active = db.open_session(&enrollment.teacher_id, &enrollment.student_id, today)?;
    let logged = db.count_sessions_on(&enrollment.teacher_id, &enrollment.student_id, today)?;
    let decision = decide(
        enrollment,
        status,
        active.as_ref().map(|session| session.id.as_str()),
        logged,
        now,
    );
    match &decision {
        Decision::Start => {
            db.start_session(
                &StartRequest {
                    teacher_id: enrollment.teacher_id.clone(),
                    student: StudentRef::Id(enrollment.student_id.clone()),
                    meeting_url: enrollment.meeting_url.clone(),
                    source: StartSource::AutoDetect,
                    manual_override: false,
                    start_at: None,
                    slot_id: None,
                },
                now,
            )?;
        }
        Decision::End { session_id } => {
            let details = EndDetails {
                note: Some(DETECTED_END_NOTE.to_string()),
                ..EndDetails::default()
            };
            let ended = db.end_session(session_id, &details, now.utc)?;
            log_delivery(
                notifier.class_completed(
                    &ended.session.id,
                    &ended.session.student_id,
                    ended.settlement.payment_status,
                ),
                "class_completed",
            );
        }
        Decision::Skip(reason) => {
            debug!(
                teacher_id = %enrollment.teacher_id,
                student_id = %enrollment.student_id,
                %reason,
                "skipped"
            );
        }
    }
    Ok(decision)
}

/// Applies probe results to every enrollment in `groups`.
///
/// Failures are counted per enrollment; one bad row never stops the run. A
/// probe transport error is counted and then read as an unreachable meeting.
pub fn apply(
    db: &mut Database,
    groups: &BTreeMap<String, Vec<Enrollment>>,
    statuses: &BTreeMap<String, MeetingStatus>,
    now: &Moment,
    notifier: &dyn Notifier,
) -> (DetectionStats, Vec<Outcome>) {
    let mut stats = DetectionStats::default();
    let mut outcomes = Vec::new();
    for (key, enrollments) in groups {
        let status = statuses
            .get(key)
            .cloned()
            .unwrap_or_else(|| MeetingStatus::failed("not probed"));
        for enrollment in enrollments {
            stats.checked += 1;
            let mut outcome = Outcome {
                teacher_id: enrollment.teacher_id.clone(),
                student_id: enrollment.student_id.clone(),
                meeting_url: key.clone(),
                decision: None,
                error: None,
            };
            if let Some(error) = &status.error {
                stats.errors += 1;
                warn!(url = %key, %error, "meeting probe failed, treating as inaccessible");
                outcome.error = Some(error.clone());
            }
            match process(db, enrollment, &status, now, notifier) {
                Ok(decision) => {
                    stats.record(&decision);
                    outcome.decision = Some(decision);
                }
                Err(err) => {
                    stats.errors += 1;
                    warn!(
                        teacher_id = %enrollment.teacher_id,
                        student_id = %enrollment.student_id,
                        error = %err,
                        "detection failed for enrollment"
                    );
                    outcome.error = Some(err.to_string());
                }
            }
            outcomes.push(outcome);
        }
    }
    (stats, outcomes)
}

/// One full detection pass: probe, apply, then sweep stale sessions.
pub fn run_detection(
    db: &mut Database,
    probe: &dyn MeetingActivityProbe,
    concurrency: usize,
    notifier: &dyn Notifier,
    now: &Moment,
) -> Result<DetectionReport> {
    let groups = group_by_url(db.watched_enrollments()?);
    let targets: BTreeMap<String, String> = groups
        .iter()
        .filter_map(|(key, group)| {
            group
                .first()
                .and_then(Enrollment::watched_url)
                .map(|url| (key.clone(), url.to_string()))
        })
        .collect();
    debug!(urls = targets.len(), "probing meeting URLs");

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let statuses = runtime.block_on(probe_all(probe, &targets, concurrency));

    let (mut stats, outcomes) = apply(db, &groups, &statuses, now, notifier);

    let mut cleaned = Vec::new();
    match db.cleanup_stale_sessions(now.utc) {
        Ok(report) => {
            stats.cleaned_up = report.cleaned_up();
            stats.errors += report.errors;
            cleaned = report.cleaned;
        }
        Err(err) => {
            stats.errors += 1;
            warn!(error = %err, "stale session cleanup failed");
        }
    }

    info!(
        checked = stats.checked,
        started = stats.started,
        ended = stats.ended,
        skipped = stats.skipped,
        errors = stats.errors,
        cleaned_up = stats.cleaned_up,
        "detection run finished"
    );
    Ok(DetectionReport {
        efficiency: stats.efficiency(),
        error_rate: stats.error_rate(),
        stats,
        outcomes,
        cleaned,
    })
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    notifier: &dyn Notifier,
    now: &Moment,
) -> Result<()> {
    let probe = HttpProbe::new(config.probe_timeout())?;
    let report = run_detection(db, &probe, config.probe_concurrency(), notifier, now)?;
    write_json(writer, &report)
}

/// Closes stale in-progress sessions without probing anything.
pub fn cleanup<W: Write>(writer: &mut W, db: &mut Database, now: &Moment) -> Result<()> {
    let report = db
        .cleanup_stale_sessions(now.utc)
        .context("failed to clean up stale sessions")?;
    info!(
        checked = report.checked,
        cleaned_up = report.cleaned_up(),
        errors = report.errors,
        "cleanup finished"
    );
    write_json(writer, &report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{RecordingNotifier, buy, enroll, monday_morning};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use tc_core::SkipReason;
    use tc_core::types::PaymentStatus;

    const URL: &str = "https://meet.example.com/abc-defg";

    /// Answers every probe with the same status and counts calls.
    struct FixedProbe {
        status: MeetingStatus,
        calls: Mutex<Vec<String>>,
    }

    impl FixedProbe {
        fn new(status: MeetingStatus) -> Self {
            Self {
                status,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MeetingActivityProbe for FixedProbe {
        async fn probe(&self, url: &str) -> MeetingStatus {
            self.calls.lock().unwrap().push(url.to_string());
            self.status.clone()
        }
    }

    fn live() -> FixedProbe {
        FixedProbe::new(MeetingStatus::observed(true, false))
    }

    fn gone() -> FixedProbe {
        FixedProbe::new(MeetingStatus::observed(false, false).with_http_status(404))
    }

    #[tokio::test]
    async fn probes_each_target_once() {
        let probe = live();
        let targets = BTreeMap::from([
            ("a".to_string(), "https://a.example.com".to_string()),
            ("b".to_string(), "https://b.example.com".to_string()),
        ]);
        let statuses = probe_all(&probe, &targets, 1).await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses["a"].is_accessible);
        assert_eq!(probe.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn live_meeting_starts_then_gone_meeting_ends() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", Some(URL));
        buy(&mut db, "t1", "s1", 3.0);
        let notifier = RecordingNotifier::default();
        let now = monday_morning();

        let report = run_detection(&mut db, &live(), 4, &notifier, &now).unwrap();
        assert_eq!(report.stats.checked, 1);
        assert_eq!(report.stats.started, 1);
        assert_eq!(report.outcomes[0].decision, Some(Decision::Start));
        let session = db.open_session("t1", "s1", now.local_date()).unwrap().unwrap();
        assert!(session.detected_automatically);

        let again = run_detection(&mut db, &live(), 4, &notifier, &now).unwrap();
        assert_eq!(
            again.outcomes[0].decision,
            Some(Decision::Skip(SkipReason::AlreadyActive))
        );

        let later = now.at(now.utc + Duration::minutes(90));
        let report = run_detection(&mut db, &gone(), 4, &notifier, &later).unwrap();
        assert_eq!(report.stats.ended, 1);
        assert!((report.efficiency - 1.0).abs() < f64::EPSILON);
        assert_eq!(notifier.kinds(), vec!["class_completed"]);

        let ended = db.session(&session.id).unwrap().unwrap();
        assert_eq!(ended.duration_minutes, Some(90));
        assert_eq!(ended.payment_status, Some(PaymentStatus::Paid));
        assert!(ended.notes.unwrap().contains(DETECTED_END_NOTE));
    }

    #[test]
    fn shared_url_is_probed_once_for_all_enrollments() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", Some(URL));
        enroll(&mut db, "t1", "s2", Some("HTTPS://meet.example.com/abc-defg/"));
        let probe = live();
        let report =
            run_detection(&mut db, &probe, 4, &RecordingNotifier::default(), &monday_morning())
                .unwrap();
        assert_eq!(probe.calls.lock().unwrap().len(), 1);
        assert_eq!(report.stats.checked, 2);
        assert_eq!(report.stats.started, 2);
    }

    #[test]
    fn timed_out_meeting_ends_the_class() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", Some(URL));
        buy(&mut db, "t1", "s1", 3.0);
        let now = monday_morning();
        run_detection(&mut db, &live(), 4, &RecordingNotifier::default(), &now).unwrap();

        let flaky = FixedProbe::new(MeetingStatus::failed("operation timed out"));
        let notifier = RecordingNotifier::default();
        let later = now.at(now.utc + Duration::minutes(60));
        let report = run_detection(&mut db, &flaky, 4, &notifier, &later).unwrap();
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.ended, 1);
        assert_eq!(report.outcomes[0].error.as_deref(), Some("operation timed out"));
        assert!(matches!(report.outcomes[0].decision, Some(Decision::End { .. })));
        assert!(db.open_session("t1", "s1", now.local_date()).unwrap().is_none());
        assert_eq!(notifier.kinds(), vec!["class_completed"]);

        let account = db.credit_account("s1", "t1").unwrap().unwrap();
        assert!((account.balance_hours - 2.0).abs() < 1e-9);
    }

    #[test]
    fn run_sweeps_stale_sessions() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", None);
        let now = monday_morning();
        db.start_session(
            &StartRequest {
                teacher_id: "t1".to_string(),
                student: StudentRef::Id("s1".to_string()),
                meeting_url: None,
                source: StartSource::AutoDetect,
                manual_override: false,
                start_at: None,
                slot_id: None,
            },
            &now,
        )
        .unwrap();

        let later = now.at(now.utc + Duration::hours(4));
        let report =
            run_detection(&mut db, &live(), 4, &RecordingNotifier::default(), &later).unwrap();
        assert_eq!(report.stats.checked, 0);
        assert_eq!(report.stats.cleaned_up, 1);
        assert_eq!(report.cleaned.len(), 1);
    }
}
