//! Storage layer for tuition class management.
//!
//! Persists enrollments, credit accounts, class sessions, schedule slots and
//! waitlists using `rusqlite`, and owns the units of work that must be
//! atomic: settlement, session start, and slot booking.
//!
//! # Thread Safety
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not
//! `Sync`. Separate processes may share one file; every write that reads
//! before it writes runs inside a `BEGIN IMMEDIATE` transaction so SQLite's
//! write lock serialises the whole read/compute/write sequence.
//!
//! # Schema
//!
//! ## Value formats
//!
//! - Instants: RFC 3339 UTC with millisecond precision
//!   (`2024-01-15T10:30:00.000Z`), so text order is time order.
//! - Dates: `YYYY-MM-DD`.
//! - Times of day: `HH:MM`.
//! - Weekdays: integers with Sunday = 0.
//! - Enums: their snake_case string forms.
//!
//! ## Invariants enforced by the schema
//!
//! - One `in_progress` class session per (teacher, student, date), through a
//!   partial unique index.
//! - Credit balances are never negative (`CHECK`).
//! - One credit account per (student, teacher).

mod credits;
mod enrollments;
mod recurring;
mod sessions;
mod slots;
mod waitlist;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc, Weekday};
use rusqlite::{Connection, ErrorCode};
use tc_core::conflict::SlotConflicts;
use tc_core::time_range::{parse_time_of_day, weekday_from_index, weekday_index};
use tc_core::ValidationError;
use thiserror::Error;
use uuid::Uuid;

pub use credits::CreditPurchase;
pub use enrollments::{NewEnrollment, StudentRef};
pub use recurring::{RecurringOutcome, RecurringRequest, SeriesOutcome};
pub use sessions::{CleanedSession, CleanupReport, EndedSession, SessionFilter, StartRequest};
pub use slots::{
    BOOKING_CREDIT_HOURS, BookingOutcome, CancellationOutcome, CreatedSlot, ResolveOutcome,
};
pub use waitlist::{JoinOutcome, ManageOutcome};

/// Database errors.
///
/// The variants follow the caller-facing taxonomy: validation, conflict and
/// not-found errors are raised before any mutation; [`DbError::Sqlite`] is a
/// dependency failure that rolled the unit of work back and may be retried.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Input rejected by a domain rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The operation collides with existing state.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        /// The row the caller collided with, when there is exactly one.
        existing_id: Option<String>,
    },
    /// Candidates overlap existing slots, templates or blocks.
    #[error("{} candidate(s) conflict with the existing schedule", .0.len())]
    SlotConflicts(Vec<SlotConflicts>),
    /// Unknown id, or a row owned by someone else.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// `auto_adjust` found nothing free within the search radius.
    #[error("no conflict-free alternative for {candidate}")]
    NoAlternative { candidate: String },
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp for {row_id}: {value}")]
    TimestampParse {
        row_id: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored value did not decode into its domain type.
    #[error("invalid stored value for {row_id}: {message}")]
    InvalidRow { row_id: String, message: String },
}

impl DbError {
    /// Whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Sqlite(_))
    }

    /// Conflict error carrying the id of the colliding row.
    pub fn conflict(message: impl Into<String>, existing_id: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            existing_id: Some(existing_id.into()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Whether `err` is a uniqueness or check constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                student_email TEXT,
                meeting_url TEXT,
                classes_per_week INTEGER NOT NULL DEFAULT 1 CHECK (classes_per_week >= 0),
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                UNIQUE (teacher_id, student_id)
            );

            CREATE INDEX IF NOT EXISTS idx_enrollments_email ON enrollments(teacher_id, student_email);

            -- Tentative weekly schedule; day_of_week uses Sunday = 0
            CREATE TABLE IF NOT EXISTS enrollment_schedule (
                enrollment_id TEXT NOT NULL,
                day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
                start_time TEXT NOT NULL,
                PRIMARY KEY (enrollment_id, day_of_week, start_time),
                FOREIGN KEY (enrollment_id) REFERENCES enrollments(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS credit_accounts (
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                teacher_id TEXT NOT NULL,
                parent_id TEXT,
                balance_hours REAL NOT NULL DEFAULT 0 CHECK (balance_hours >= 0),
                total_purchased REAL NOT NULL DEFAULT 0,
                total_used REAL NOT NULL DEFAULT 0,
                rate_per_hour REAL,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                UNIQUE (student_id, teacher_id)
            );

            -- Append-only ledger; rowid is the application order
            CREATE TABLE IF NOT EXISTS credit_transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                type TEXT NOT NULL,
                hours_amount REAL NOT NULL,
                balance_after REAL NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                description TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES credit_accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_credit_tx_account ON credit_transactions(account_id);
            CREATE INDEX IF NOT EXISTS idx_credit_tx_reference ON credit_transactions(reference_type, reference_id);

            CREATE TABLE IF NOT EXISTS class_sessions (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                enrollment_id TEXT,
                slot_id TEXT,
                date TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_minutes INTEGER,
                status TEXT NOT NULL,
                detected_automatically INTEGER NOT NULL DEFAULT 0,
                credits_deducted REAL,
                payment_status TEXT,
                is_paid INTEGER NOT NULL DEFAULT 0,
                content TEXT,
                topics TEXT,
                homework TEXT,
                notes TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_in_progress
                ON class_sessions(teacher_id, student_id, date)
                WHERE status = 'in_progress';
            CREATE INDEX IF NOT EXISTS idx_sessions_pair_date ON class_sessions(teacher_id, student_id, date);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON class_sessions(status, start_time);

            CREATE TABLE IF NOT EXISTS time_slot_templates (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                subject TEXT,
                duration_minutes INTEGER NOT NULL,
                is_available INTEGER NOT NULL DEFAULT 1,
                is_recurring INTEGER NOT NULL DEFAULT 1,
                recurrence_end_date TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_templates_teacher_day ON time_slot_templates(teacher_id, day_of_week);

            CREATE TABLE IF NOT EXISTS schedule_slots (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                date TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'available',
                student_id TEXT,
                subject TEXT,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                template_id TEXT,
                is_override INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_slots_teacher_date ON schedule_slots(teacher_id, date);

            CREATE TABLE IF NOT EXISTS blocked_slots (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                day_of_week INTEGER CHECK (day_of_week BETWEEN 0 AND 6),
                date TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                reason TEXT,
                CHECK (day_of_week IS NOT NULL OR date IS NOT NULL)
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_teacher ON blocked_slots(teacher_id);

            -- Target is either slot_id or (day_of_week, start_time, end_time)
            CREATE TABLE IF NOT EXISTS waitlist_entries (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                slot_id TEXT,
                day_of_week INTEGER CHECK (day_of_week BETWEEN 0 AND 6),
                start_time TEXT,
                end_time TEXT,
                status TEXT NOT NULL DEFAULT 'waiting',
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                notified_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_waitlist_teacher_status ON waitlist_entries(teacher_id, status);
            ",
        )?;
        Ok(())
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str, row_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            row_id: row_id.to_string(),
            value: value.to_string(),
            source,
        })
}

fn parse_optional_timestamp(
    value: Option<&str>,
    row_id: &str,
) -> Result<Option<DateTime<Utc>>, DbError> {
    value.map(|v| parse_timestamp(v, row_id)).transpose()
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(value: &str, row_id: &str) -> Result<NaiveDate, DbError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|source| DbError::TimestampParse {
        row_id: row_id.to_string(),
        value: value.to_string(),
        source,
    })
}

fn parse_time(value: &str, row_id: &str) -> Result<NaiveTime, DbError> {
    parse_time_of_day(value).map_err(|err| DbError::InvalidRow {
        row_id: row_id.to_string(),
        message: err.to_string(),
    })
}

fn format_weekday(day: Weekday) -> i64 {
    i64::from(weekday_index(day))
}

fn parse_weekday(value: i64, row_id: &str) -> Result<Weekday, DbError> {
    u32::try_from(value)
        .ok()
        .and_then(weekday_from_index)
        .ok_or_else(|| DbError::InvalidRow {
            row_id: row_id.to_string(),
            message: format!("day_of_week out of range: {value}"),
        })
}

/// Decodes a stored enum string.
fn parse_enum<T>(value: &str, row_id: &str) -> Result<T, DbError>
where
    T: FromStr<Err = ValidationError>,
{
    value.parse().map_err(|err: ValidationError| DbError::InvalidRow {
        row_id: row_id.to_string(),
        message: err.to_string(),
    })
}
