//! Class session persistence and the start/end units of work.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tc_core::credit::SettlementOutcome;
use tc_core::session::{
    ClassSession, EndDetails, StaleReason, StartSource, append_note, classify_stale, close_times,
    stale_close_times, validate_start,
};
use tc_core::time_range::Moment;
use tc_core::types::{SessionStatus, ValidationError, require_non_empty};
use tracing::{debug, info, warn};

use crate::credits::settle_in;
use crate::enrollments::{StudentRef, find_active_enrollment};
use crate::{
    Database, DbError, format_date, format_timestamp, is_constraint_violation, new_id, parse_date,
    parse_enum, parse_optional_timestamp, parse_timestamp,
};

/// A request to start a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub teacher_id: String,
    pub student: StudentRef,
    #[serde(default)]
    pub meeting_url: Option<String>,
    pub source: StartSource,
    /// Skip URL, class-hours and schedule checks.
    #[serde(default)]
    pub manual_override: bool,
    /// Out-of-band correction of the start instant.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub slot_id: Option<String>,
}

/// A completed session and the settlement it triggered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndedSession {
    pub session: ClassSession,
    pub settlement: SettlementOutcome,
}

/// One session closed by the cleanup sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedSession {
    pub session_id: String,
    pub reason: StaleReason,
    pub duration_minutes: i64,
    pub settlement: SettlementOutcome,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub checked: u32,
    pub errors: u32,
    pub cleaned: Vec<CleanedSession>,
}

impl CleanupReport {
    pub fn cleaned_up(&self) -> u32 {
        u32::try_from(self.cleaned.len()).unwrap_or(u32::MAX)
    }
}

/// Filters for [`Database::list_sessions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter<'a> {
    pub teacher_id: Option<&'a str>,
    pub student_id: Option<&'a str>,
    pub date: Option<NaiveDate>,
    pub status: Option<SessionStatus>,
}

const SESSION_COLUMNS: &str = "id, teacher_id, student_id, enrollment_id, slot_id, date, start_time, end_time, duration_minutes, status, detected_automatically, credits_deducted, payment_status, is_paid, content, topics, homework, notes, created_at";

struct SessionRow {
    id: String,
    teacher_id: String,
    student_id: String,
    enrollment_id: Option<String>,
    slot_id: Option<String>,
    date: String,
    start_time: String,
    end_time: Option<String>,
    duration_minutes: Option<i64>,
    status: String,
    detected_automatically: bool,
    credits_deducted: Option<f64>,
    payment_status: Option<String>,
    is_paid: bool,
    content: Option<String>,
    topics: Option<String>,
    homework: Option<String>,
    notes: Option<String>,
    created_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        student_id: row.get(2)?,
        enrollment_id: row.get(3)?,
        slot_id: row.get(4)?,
        date: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        duration_minutes: row.get(8)?,
        status: row.get(9)?,
        detected_automatically: row.get(10)?,
        credits_deducted: row.get(11)?,
        payment_status: row.get(12)?,
        is_paid: row.get(13)?,
        content: row.get(14)?,
        topics: row.get(15)?,
        homework: row.get(16)?,
        notes: row.get(17)?,
        created_at: row.get(18)?,
    })
}

impl SessionRow {
    fn decode(self) -> Result<ClassSession, DbError> {
        let id = self.id;
        Ok(ClassSession {
            date: parse_date(&self.date, &id)?,
            start_time: parse_timestamp(&self.start_time, &id)?,
            end_time: parse_optional_timestamp(self.end_time.as_deref(), &id)?,
            status: parse_enum(&self.status, &id)?,
            payment_status: self
                .payment_status
                .map(|status| parse_enum(&status, &id))
                .transpose()?,
            created_at: parse_timestamp(&self.created_at, &id)?,
            teacher_id: self.teacher_id,
            student_id: self.student_id,
            enrollment_id: self.enrollment_id,
            slot_id: self.slot_id,
            duration_minutes: self.duration_minutes,
            detected_automatically: self.detected_automatically,
            credits_deducted: self.credits_deducted,
            is_paid: self.is_paid,
            content: self.content,
            topics: self.topics,
            homework: self.homework,
            notes: self.notes,
            id,
        })
    }
}

fn load_session(conn: &Connection, id: &str) -> Result<Option<ClassSession>, DbError> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM class_sessions WHERE id = ?"),
        [id],
        read_row,
    )
    .optional()?
    .map(SessionRow::decode)
    .transpose()
}

fn open_session_id(
    conn: &Connection,
    teacher_id: &str,
    student_id: &str,
    date: NaiveDate,
) -> Result<Option<String>, DbError> {
    Ok(conn
        .query_row(
            "
            SELECT id FROM class_sessions
            WHERE teacher_id = ? AND student_id = ? AND date = ? AND status = 'in_progress'
            ",
            params![teacher_id, student_id, format_date(date)],
            |row| row.get(0),
        )
        .optional()?)
}

fn in_progress_conflict(existing_id: String) -> DbError {
    DbError::conflict("a class is already in progress for this student today", existing_id)
}

/// Marks an in-progress session completed. Returns false when it was no
/// longer in progress.
fn complete_in(
    conn: &Connection,
    session: &ClassSession,
    end: DateTime<Utc>,
    minutes: i64,
    details: &EndDetails,
) -> Result<bool, DbError> {
    let notes = match details.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(note) => Some(append_note(session.notes.as_deref(), note)),
        None => session.notes.clone(),
    };
    let updated = conn.execute(
        "
        UPDATE class_sessions
        SET status = 'completed',
            end_time = ?,
            duration_minutes = ?,
            content = COALESCE(?, content),
            topics = COALESCE(?, topics),
            homework = COALESCE(?, homework),
            notes = ?
        WHERE id = ? AND status = 'in_progress'
        ",
        params![
            format_timestamp(end),
            minutes,
            details.content,
            details.topics,
            details.homework,
            notes,
            session.id,
        ],
    )?;
    if updated == 1 {
        if let Some(slot_id) = &session.slot_id {
            conn.execute(
                "UPDATE schedule_slots SET status = 'completed' WHERE id = ? AND status = 'booked'",
                [slot_id],
            )?;
        }
    }
    Ok(updated == 1)
}

impl Database {
    /// Starts a class.
    ///
    /// The open-session check and the insert share one immediate transaction,
    /// backed by the partial unique index, so two racing starts cannot both
    /// succeed.
    pub fn start_session(
        &mut self,
        request: &StartRequest,
        now: &Moment,
    ) -> Result<ClassSession, DbError> {
        require_non_empty("teacher id", &request.teacher_id)?;
        require_non_empty("student", request.student.as_str())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let enrollment = find_active_enrollment(&tx, &request.teacher_id, &request.student)?
            .ok_or_else(|| DbError::not_found("enrollment", request.student.as_str()))?;
        validate_start(
            &enrollment,
            request.meeting_url.as_deref(),
            request.source,
            request.manual_override,
            now,
        )?;

        let start = request.start_at.unwrap_or(now.utc);
        let date = now.at(start).local_date();
        if let Some(existing) =
            open_session_id(&tx, &request.teacher_id, &enrollment.student_id, date)?
        {
            return Err(in_progress_conflict(existing));
        }

        let id = new_id();
        let inserted = tx.execute(
            "
            INSERT INTO class_sessions
                (id, teacher_id, student_id, enrollment_id, slot_id, date, start_time, status,
                 detected_automatically, is_paid, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'in_progress', ?, 0, ?)
            ",
            params![
                id,
                request.teacher_id,
                enrollment.student_id,
                enrollment.id,
                request.slot_id,
                format_date(date),
                format_timestamp(start),
                request.source == StartSource::AutoDetect,
                format_timestamp(now.utc),
            ],
        );
        if let Err(err) = inserted {
            if is_constraint_violation(&err) {
                let existing =
                    open_session_id(&tx, &request.teacher_id, &enrollment.student_id, date)?
                        .unwrap_or_default();
                return Err(in_progress_conflict(existing));
            }
            return Err(err.into());
        }
        let session =
            load_session(&tx, &id)?.ok_or_else(|| DbError::not_found("session", id.clone()))?;
        tx.commit()?;

        info!(
            session_id = %session.id,
            teacher_id = %session.teacher_id,
            student_id = %session.student_id,
            source = %request.source,
            "class started"
        );
        Ok(session)
    }

    /// Ends an in-progress class and settles it in the same transaction.
    ///
    /// On any failure nothing is written and the session stays in progress.
    pub fn end_session(
        &mut self,
        session_id: &str,
        details: &EndDetails,
        now: DateTime<Utc>,
    ) -> Result<EndedSession, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = load_session(&tx, session_id)?
            .ok_or_else(|| DbError::not_found("session", session_id))?;
        if !session.is_in_progress() {
            return Err(ValidationError::InvalidState {
                entity: "session",
                id: session.id,
                status: session.status.to_string(),
                expected: "in_progress",
            }
            .into());
        }
        let (end, minutes) = close_times(&session, details.end_at, now)?;
        if !complete_in(&tx, &session, end, minutes, details)? {
            return Err(DbError::conflict("session was ended concurrently", session_id));
        }
        let settlement = settle_in(&tx, session_id, now)?;
        let session = load_session(&tx, session_id)?
            .ok_or_else(|| DbError::not_found("session", session_id))?;
        tx.commit()?;

        info!(
            session_id,
            duration_minutes = minutes,
            payment_status = %settlement.payment_status,
            "class ended"
        );
        Ok(EndedSession {
            session,
            settlement,
        })
    }

    pub fn session(&self, id: &str) -> Result<Option<ClassSession>, DbError> {
        load_session(&self.conn, id)
    }

    /// The pair's open session on `date`, if any.
    pub fn open_session(
        &self,
        teacher_id: &str,
        student_id: &str,
        date: NaiveDate,
    ) -> Result<Option<ClassSession>, DbError> {
        match open_session_id(&self.conn, teacher_id, student_id, date)? {
            Some(id) => load_session(&self.conn, &id),
            None => Ok(None),
        }
    }

    /// Sessions logged for the pair on `date`, in any status.
    pub fn count_sessions_on(
        &self,
        teacher_id: &str,
        student_id: &str,
        date: NaiveDate,
    ) -> Result<u32, DbError> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM class_sessions WHERE teacher_id = ? AND student_id = ? AND date = ?",
            params![teacher_id, student_id, format_date(date)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Lists sessions, newest first.
    pub fn list_sessions(&self, filter: &SessionFilter<'_>) -> Result<Vec<ClassSession>, DbError> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(teacher_id) = filter.teacher_id {
            clauses.push("teacher_id = ?");
            values.push(teacher_id.to_string());
        }
        if let Some(student_id) = filter.student_id {
            clauses.push("student_id = ?");
            values.push(student_id.to_string());
        }
        if let Some(date) = filter.date {
            clauses.push("date = ?");
            values.push(format_date(date));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM class_sessions {where_clause} ORDER BY start_time DESC, id ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), read_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.decode()?);
        }
        Ok(sessions)
    }

    /// Force-completes stale in-progress sessions and settles them.
    ///
    /// Each session is closed in its own transaction; a failure is counted
    /// and logged and the sweep moves on.
    pub fn cleanup_stale_sessions(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, DbError> {
        let open = self.list_sessions(&SessionFilter {
            status: Some(SessionStatus::InProgress),
            ..SessionFilter::default()
        })?;
        let mut report = CleanupReport::default();
        for session in open {
            report.checked += 1;
            let Some(reason) = classify_stale(&session, now) else {
                continue;
            };
            match self.close_stale(&session, reason, now) {
                Ok(Some(cleaned)) => {
                    info!(
                        session_id = %cleaned.session_id,
                        reason = reason.note(),
                        duration_minutes = cleaned.duration_minutes,
                        "stale session closed"
                    );
                    report.cleaned.push(cleaned);
                }
                Ok(None) => debug!(session_id = %session.id, "stale session already closed"),
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "failed to close stale session");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    fn close_stale(
        &mut self,
        session: &ClassSession,
        reason: StaleReason,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanedSession>, DbError> {
        let (end, minutes) = stale_close_times(session, reason, now);
        let details = EndDetails {
            note: Some(reason.note().to_string()),
            ..EndDetails::default()
        };
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !complete_in(&tx, session, end, minutes, &details)? {
            return Ok(None);
        }
        let settlement = settle_in(&tx, &session.id, now)?;
        tx.commit()?;
        Ok(Some(CleanedSession {
            session_id: session.id.clone(),
            reason,
            duration_minutes: minutes,
            settlement,
        }))
    }
}
