//! Status command: enrollments and classes currently running.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use tc_core::Moment;
use tc_core::time_range::elapsed_minutes;
use tc_core::types::SessionStatus;
use tc_db::{Database, SessionFilter};

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path, now: &Moment) -> Result<()> {
    let enrollments = db.list_enrollments(None)?;
    let active = enrollments.iter().filter(|e| e.is_active).count();
    let watched = db.watched_enrollments()?.len();
    let open = db.list_sessions(&SessionFilter {
        status: Some(SessionStatus::InProgress),
        ..SessionFilter::default()
    })?;

    writeln!(writer, "Tuition class status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Enrollments: {active} active, {watched} watched")?;

    if open.is_empty() {
        writeln!(writer, "No classes in progress.")?;
        return Ok(());
    }

    writeln!(writer, "In progress:")?;
    for session in open {
        writeln!(
            writer,
            "- {} / {}: {} min{}",
            session.teacher_id,
            session.student_id,
            elapsed_minutes(session.start_time, now.utc),
            if session.detected_automatically {
                " (auto)"
            } else {
                ""
            }
        )?;
    }

    Ok(())
}
