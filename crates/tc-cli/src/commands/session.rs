//! Class session lifecycle: start, end, settle, list.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use tc_core::notify::log_delivery;
use tc_core::{EndDetails, MeetingStatus, Moment, Notifier, StartSource};
use tc_db::{Database, SessionFilter, StartRequest, StudentRef};
use tc_probe::{HttpProbe, MeetingActivityProbe};
use tracing::warn;

use super::util::{parse_datetime, write_json};
use crate::{Config, SessionAction};

/// Reports whether the meeting answered. A failed check only warns; the
/// start always proceeds.
pub fn check_reachable(url: &str, status: &MeetingStatus) -> bool {
    if let Some(error) = &status.error {
        warn!(url, error = %error, "meeting URL check failed; starting anyway");
        return false;
    }
    if status.is_definitely_unreachable() {
        warn!(
            url,
            http_status = status.http_status,
            "meeting URL refused the check; starting anyway"
        );
        return false;
    }
    true
}

fn verify_meeting(url: &str, timeout: Duration) -> Result<()> {
    let probe = HttpProbe::new(timeout)?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let status = runtime.block_on(probe.probe(url));
    check_reachable(url, &status);
    Ok(())
}

#[expect(
    clippy::too_many_lines,
    reason = "one arm per session subcommand"
)]
pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &SessionAction,
    config: &Config,
    notifier: &dyn Notifier,
    now: &Moment,
) -> Result<()> {
    match action {
        SessionAction::Start {
            teacher,
            student,
            meeting_url,
            source,
            manual_override,
            at,
            slot,
            no_verify,
        } => {
            let start_at = at
                .as_deref()
                .map(|value| parse_datetime(value, now.utc))
                .transpose()?;
            if let Some(url) = meeting_url.as_deref() {
                let verify = config.verify_meeting_url
                    && !*no_verify
                    && !*manual_override
                    && *source != StartSource::AutoDetect;
                if verify {
                    verify_meeting(url, config.probe_timeout())?;
                }
            }
            let request = StartRequest {
                teacher_id: teacher.clone(),
                student: StudentRef::parse(student),
                meeting_url: meeting_url.clone(),
                source: *source,
                manual_override: *manual_override,
                start_at,
                slot_id: slot.clone(),
            };
            let session = db
                .start_session(&request, now)
                .context("failed to start class")?;
            write_json(writer, &session)
        }
        SessionAction::End {
            session_id,
            content,
            topics,
            homework,
            note,
            at,
        } => {
            let details = EndDetails {
                end_at: at
                    .as_deref()
                    .map(|value| parse_datetime(value, now.utc))
                    .transpose()?,
                content: content.clone(),
                topics: topics.clone(),
                homework: homework.clone(),
                note: note.clone(),
            };
            let ended = db
                .end_session(session_id, &details, now.utc)
                .context("failed to end class")?;
            log_delivery(
                notifier.class_completed(
                    &ended.session.id,
                    &ended.session.student_id,
                    ended.settlement.payment_status,
                ),
                "class_completed",
            );
            write_json(writer, &ended)
        }
        SessionAction::Settle { session_id } => {
            let outcome = db
                .settle_session_at(session_id, now.utc)
                .context("failed to settle class")?;
            write_json(writer, &outcome)
        }
        SessionAction::List {
            teacher,
            student,
            date,
            status,
        } => {
            let sessions = db.list_sessions(&SessionFilter {
                teacher_id: teacher.as_deref(),
                student_id: student.as_deref(),
                date: *date,
                status: *status,
            })?;
            write_json(writer, &sessions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{RecordingNotifier, buy, enroll, monday_morning};
    use serde_json::Value;

    fn start(db: &mut Database, now: &Moment) -> Result<Value> {
        let mut output = Vec::new();
        run(
            &mut output,
            db,
            &SessionAction::Start {
                teacher: "t1".to_string(),
                student: "s1".to_string(),
                meeting_url: None,
                source: StartSource::Manual,
                manual_override: false,
                at: None,
                slot: None,
                no_verify: false,
            },
            &Config::default(),
            &RecordingNotifier::default(),
            now,
        )?;
        Ok(serde_json::from_slice(&output)?)
    }

    fn end(db: &mut Database, id: &str, notifier: &RecordingNotifier, now: &Moment) -> Value {
        let mut output = Vec::new();
        run(
            &mut output,
            db,
            &SessionAction::End {
                session_id: id.to_string(),
                content: Some("fractions".to_string()),
                topics: None,
                homework: Some("page 12".to_string()),
                note: None,
                at: None,
            },
            &Config::default(),
            notifier,
            now,
        )
        .unwrap();
        serde_json::from_slice(&output).unwrap()
    }

    #[test]
    fn start_end_settles_and_notifies() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", None);
        buy(&mut db, "t1", "s1", 2.0);

        let now = monday_morning();
        let session = start(&mut db, &now).unwrap();
        assert_eq!(session["status"], "in_progress");
        let id = session["id"].as_str().unwrap().to_string();

        let notifier = RecordingNotifier::default();
        let later = now.at(now.utc + chrono::Duration::minutes(60));
        let ended = end(&mut db, &id, &notifier, &later);
        assert_eq!(ended["session"]["status"], "completed");
        assert_eq!(ended["session"]["duration_minutes"], 60);
        assert_eq!(ended["settlement"]["credits_deducted"], 1.0);
        assert_eq!(ended["settlement"]["payment_status"], "paid");
        assert_eq!(notifier.kinds(), vec!["class_completed"]);

        let account = db.credit_account("s1", "t1").unwrap().unwrap();
        assert!((account.balance_hours - 1.0).abs() < 1e-9);
    }

    #[test]
    fn settle_replays_without_deducting_twice() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", None);
        buy(&mut db, "t1", "s1", 2.0);
        let now = monday_morning();
        let id = start(&mut db, &now).unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        let later = now.at(now.utc + chrono::Duration::minutes(30));
        end(&mut db, &id, &RecordingNotifier::default(), &later);

        let mut output = Vec::new();
        run(
            &mut output,
            &mut db,
            &SessionAction::Settle { session_id: id },
            &Config::default(),
            &RecordingNotifier::default(),
            &later,
        )
        .unwrap();
        let outcome: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(outcome["already_processed"], true);
        let account = db.credit_account("s1", "t1").unwrap().unwrap();
        assert!((account.balance_hours - 1.5).abs() < 1e-9);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", None);
        let now = monday_morning();
        start(&mut db, &now).unwrap();
        assert!(start(&mut db, &now).is_err());
    }

    #[test]
    fn unknown_enrollment_is_an_error() {
        let mut db = Database::open_in_memory().unwrap();
        let err = start(&mut db, &monday_morning()).unwrap_err();
        assert!(format!("{err:#}").contains("enrollment not found"));
    }

    /// Answers one request with `status` and closes.
    fn serve_once(status: u16) -> String {
        use std::io::Read;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/room", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0_u8; 2048];
            let _ = stream.read(&mut buf).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        });
        url
    }

    #[test]
    fn forbidden_meeting_url_still_starts() {
        let url = serve_once(403);
        let mut db = Database::open_in_memory().unwrap();
        enroll(&mut db, "t1", "s1", Some(&url));

        let mut output = Vec::new();
        run(
            &mut output,
            &mut db,
            &SessionAction::Start {
                teacher: "t1".to_string(),
                student: "s1".to_string(),
                meeting_url: Some(url),
                source: StartSource::Manual,
                manual_override: false,
                at: None,
                slot: None,
                no_verify: false,
            },
            &Config::default(),
            &RecordingNotifier::default(),
            &monday_morning(),
        )
        .unwrap();
        let session: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(session["status"], "in_progress");
    }

    #[test]
    fn refused_meeting_check_does_not_block() {
        for code in [401, 403, 404, 503] {
            let status = MeetingStatus::observed(false, false).with_http_status(code);
            assert!(!check_reachable("https://meet.example.com/x", &status));
        }
    }

    #[test]
    fn transport_error_fails_open() {
        let status = MeetingStatus::failed("connection refused");
        assert!(!check_reachable("https://meet.example.com/x", &status));
        assert!(check_reachable(
            "https://meet.example.com/x",
            &MeetingStatus::observed(true, false)
        ));
    }
}
