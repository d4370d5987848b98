//! Enrollment management.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tc_core::time_range::format_time;
use tc_db::{Database, NewEnrollment};

use super::util::{parse_schedule_entry, write_json};
use crate::EnrollAction;

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &EnrollAction,
    now: DateTime<Utc>,
) -> Result<()> {
    match action {
        EnrollAction::Add {
            teacher,
            student,
            email,
            meeting_url,
            classes_per_week,
            schedule,
        } => {
            let schedule = schedule
                .iter()
                .map(|entry| parse_schedule_entry(entry))
                .collect::<Result<Vec<_>>>()?;
            let enrollment = db
                .add_enrollment_at(
                    &NewEnrollment {
                        teacher_id: teacher.clone(),
                        student_id: student.clone(),
                        student_email: email.clone(),
                        meeting_url: meeting_url.clone(),
                        classes_per_week: *classes_per_week,
                        schedule,
                    },
                    now,
                )
                .context("failed to add enrollment")?;
            write_json(writer, &enrollment)
        }
        EnrollAction::List { teacher } => {
            let enrollments = db.list_enrollments(teacher.as_deref())?;
            if enrollments.is_empty() {
                writeln!(writer, "No enrollments.")?;
                return Ok(());
            }
            for enrollment in enrollments.iter().filter(|e| e.is_active) {
                write!(
                    writer,
                    "- {} / {} ({}/week)",
                    enrollment.teacher_id, enrollment.student_id, enrollment.classes_per_week
                )?;
                if let Some(url) = enrollment.watched_url() {
                    write!(writer, " {url}")?;
                }
                if !enrollment.schedule.is_empty() {
                    let slots: Vec<String> = enrollment
                        .schedule
                        .iter()
                        .map(|entry| format!("{} {}", entry.day_of_week, format_time(entry.start_time)))
                        .collect();
                    write!(writer, " [{}]", slots.join(", "))?;
                }
                writeln!(writer)?;
            }
            Ok(())
        }
    }
}
