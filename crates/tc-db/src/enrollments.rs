//! Enrollments: who teaches whom, where they meet, and when.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tc_core::enrollment::{Enrollment, ScheduleEntry, normalize_meeting_url};
use tc_core::time_range::format_time;
use tc_core::types::require_non_empty;
use tracing::info;

use crate::{
    Database, DbError, format_timestamp, format_weekday, new_id, parse_time, parse_weekday,
};

/// Enrollment to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub teacher_id: String,
    pub student_id: String,
    #[serde(default)]
    pub student_email: Option<String>,
    #[serde(default)]
    pub meeting_url: Option<String>,
    pub classes_per_week: u32,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// How a caller names a student: by id, or by the email on the enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentRef {
    Id(String),
    Email(String),
}

impl StudentRef {
    /// Anything containing `@` is treated as an email.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.contains('@') {
            Self::Email(value.to_ascii_lowercase())
        } else {
            Self::Id(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(value) | Self::Email(value) => value,
        }
    }
}

const ENROLLMENT_COLUMNS: &str =
    "id, teacher_id, student_id, student_email, meeting_url, classes_per_week, is_active";

struct EnrollmentRow {
    id: String,
    teacher_id: String,
    student_id: String,
    student_email: Option<String>,
    meeting_url: Option<String>,
    classes_per_week: i64,
    is_active: bool,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrollmentRow> {
    Ok(EnrollmentRow {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        student_id: row.get(2)?,
        student_email: row.get(3)?,
        meeting_url: row.get(4)?,
        classes_per_week: row.get(5)?,
        is_active: row.get(6)?,
    })
}

fn load_schedule(conn: &Connection, enrollment_id: &str) -> Result<Vec<ScheduleEntry>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT day_of_week, start_time
        FROM enrollment_schedule
        WHERE enrollment_id = ?
        ORDER BY day_of_week ASC, start_time ASC
        ",
    )?;
    let rows = stmt.query_map([enrollment_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut schedule = Vec::new();
    for row in rows {
        let (day, start) = row?;
        schedule.push(ScheduleEntry {
            day_of_week: parse_weekday(day, enrollment_id)?,
            start_time: parse_time(&start, enrollment_id)?,
        });
    }
    Ok(schedule)
}

fn decode(conn: &Connection, row: EnrollmentRow) -> Result<Enrollment, DbError> {
    let classes_per_week =
        u32::try_from(row.classes_per_week).map_err(|_| DbError::InvalidRow {
            row_id: row.id.clone(),
            message: format!("classes_per_week out of range: {}", row.classes_per_week),
        })?;
    let schedule = load_schedule(conn, &row.id)?;
    Ok(Enrollment {
        id: row.id,
        teacher_id: row.teacher_id,
        student_id: row.student_id,
        student_email: row.student_email,
        meeting_url: row.meeting_url,
        classes_per_week,
        is_active: row.is_active,
        schedule,
    })
}

fn query_enrollments(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Enrollment>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments {filter} ORDER BY teacher_id ASC, student_id ASC"
    ))?;
    let rows = stmt.query_map(params, read_row)?;
    let mut raw = Vec::new();
    for row in rows {
        raw.push(row?);
    }
    raw.into_iter().map(|row| decode(conn, row)).collect()
}

/// The teacher's active enrollment for `student`.
pub(crate) fn find_active_enrollment(
    conn: &Connection,
    teacher_id: &str,
    student: &StudentRef,
) -> Result<Option<Enrollment>, DbError> {
    let row = match student {
        StudentRef::Id(id) => conn
            .query_row(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                     WHERE teacher_id = ? AND student_id = ? AND is_active = 1"
                ),
                params![teacher_id, id],
                read_row,
            )
            .optional()?,
        StudentRef::Email(email) => conn
            .query_row(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                     WHERE teacher_id = ? AND lower(student_email) = ? AND is_active = 1
                     ORDER BY student_id ASC LIMIT 1"
                ),
                params![teacher_id, email],
                read_row,
            )
            .optional()?,
    };
    row.map(|row| decode(conn, row)).transpose()
}

impl Database {
    /// Creates an enrollment with its tentative schedule.
    pub fn add_enrollment(&mut self, enrollment: &NewEnrollment) -> Result<Enrollment, DbError> {
        self.add_enrollment_at(enrollment, Utc::now())
    }

    pub fn add_enrollment_at(
        &mut self,
        enrollment: &NewEnrollment,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, DbError> {
        require_non_empty("teacher id", &enrollment.teacher_id)?;
        require_non_empty("student id", &enrollment.student_id)?;
        let meeting_url = enrollment
            .meeting_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());
        let email = enrollment
            .student_email
            .as_deref()
            .map(|email| email.trim().to_ascii_lowercase())
            .filter(|email| !email.is_empty());

        let id = new_id();
        let tx = self.conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM enrollments WHERE teacher_id = ? AND student_id = ?",
                params![enrollment.teacher_id, enrollment.student_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(DbError::conflict(
                format!(
                    "student {} is already enrolled with teacher {}",
                    enrollment.student_id, enrollment.teacher_id
                ),
                existing,
            ));
        }
        tx.execute(
            "
            INSERT INTO enrollments
                (id, teacher_id, student_id, student_email, meeting_url, classes_per_week, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ",
            params![
                id,
                enrollment.teacher_id,
                enrollment.student_id,
                email,
                meeting_url,
                enrollment.classes_per_week,
                format_timestamp(now),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO enrollment_schedule (enrollment_id, day_of_week, start_time) VALUES (?, ?, ?)",
            )?;
            for entry in &enrollment.schedule {
                stmt.execute(params![
                    id,
                    format_weekday(entry.day_of_week),
                    format_time(entry.start_time)
                ])?;
            }
        }
        let created = find_active_enrollment(
            &tx,
            &enrollment.teacher_id,
            &StudentRef::Id(enrollment.student_id.clone()),
        )?
        .ok_or_else(|| DbError::not_found("enrollment", id.clone()))?;
        tx.commit()?;

        info!(
            enrollment_id = %created.id,
            teacher_id = %created.teacher_id,
            student_id = %created.student_id,
            "enrollment created"
        );
        Ok(created)
    }

    /// Lists enrollments, optionally for one teacher.
    pub fn list_enrollments(&self, teacher_id: Option<&str>) -> Result<Vec<Enrollment>, DbError> {
        match teacher_id {
            Some(teacher_id) => query_enrollments(&self.conn, "WHERE teacher_id = ?", [teacher_id]),
            None => query_enrollments(&self.conn, "", []),
        }
    }

    /// Active enrollments with a meeting URL: the auto-detector's input.
    pub fn watched_enrollments(&self) -> Result<Vec<Enrollment>, DbError> {
        query_enrollments(
            &self.conn,
            "WHERE is_active = 1 AND meeting_url IS NOT NULL AND trim(meeting_url) <> ''",
            [],
        )
    }

    pub fn find_enrollment(
        &self,
        teacher_id: &str,
        student: &StudentRef,
    ) -> Result<Option<Enrollment>, DbError> {
        find_active_enrollment(&self.conn, teacher_id, student)
    }

    /// Enrollments sharing `url` once normalised.
    pub fn enrollments_for_url(&self, url: &str) -> Result<Vec<Enrollment>, DbError> {
        let wanted = normalize_meeting_url(url);
        Ok(self
            .watched_enrollments()?
            .into_iter()
            .filter(|e| e.watched_url().map(normalize_meeting_url).as_deref() == Some(wanted.as_str()))
            .collect())
    }

    /// Deactivates an enrollment; the auto-detector stops watching it.
    pub fn deactivate_enrollment(&mut self, id: &str) -> Result<(), DbError> {
        let changed = self
            .conn
            .execute("UPDATE enrollments SET is_active = 0 WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(DbError::not_found("enrollment", id));
        }
        Ok(())
    }
}
