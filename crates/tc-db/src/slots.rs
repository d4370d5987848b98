//! Schedule slots, weekly templates, blocks and bookings.

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tc_core::conflict::{
    DateWindow, Preferences, SlotConflicts, Strategy, Suggestion, best_alternative, busy_ranges,
    collect_conflicts, suggest_alternatives,
};
use tc_core::credit::{CreditTransaction, HOURS_EPSILON};
use tc_core::slot::{BlockedSlot, CandidateSlot, ScheduleSlot, SlotTarget, TimeSlotTemplate};
use tc_core::time_range::{TimeRange, format_time};
use tc_core::types::{
    ReferenceType, SlotStatus, TransactionKind, ValidationError, require_non_empty,
};
use tc_core::waitlist::{WaitlistEntry, WaitlistTarget};
use tracing::{debug, info};

use crate::credits::{LedgerEntry, adjust_balance, append_transaction};
use crate::waitlist::notify_next_in;
use crate::{
    Database, DbError, format_date, format_timestamp, format_weekday, new_id, parse_date,
    parse_enum, parse_time, parse_timestamp, parse_weekday,
};

/// Credit hours a booking holds.
pub const BOOKING_CREDIT_HOURS: f64 = 1.0;

/// A slot or template written by a create or resolve call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedSlot {
    Slot(ScheduleSlot),
    Template(TimeSlotTemplate),
}

/// Per-candidate result of `resolve_conflict`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// Nothing to resolve and nothing created.
    NoConflict { candidate: CandidateSlot },
    Suggestions {
        conflicts: SlotConflicts,
        suggestions: Vec<Suggestion>,
    },
    Created {
        created: CreatedSlot,
        /// The alternative taken by `auto_adjust`.
        #[serde(skip_serializing_if = "Option::is_none")]
        adjusted: Option<Suggestion>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingOutcome {
    pub slot: ScheduleSlot,
    pub transaction: CreditTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationOutcome {
    pub slot: ScheduleSlot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<CreditTransaction>,
    /// Waitlist entry offered the freed time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified: Option<WaitlistEntry>,
}

/// Everything the conflict engine needs about one teacher.
pub(crate) struct TeacherSchedule {
    pub templates: Vec<TimeSlotTemplate>,
    pub slots: Vec<ScheduleSlot>,
    pub blocks: Vec<BlockedSlot>,
}

impl TeacherSchedule {
    pub(crate) fn load(conn: &Connection, teacher_id: &str) -> Result<Self, DbError> {
        Ok(Self {
            templates: teacher_templates(conn, teacher_id)?,
            slots: query_slots(
                conn,
                "WHERE teacher_id = ? AND status IN ('available', 'booked')",
                [teacher_id],
            )?,
            blocks: teacher_blocks(conn, teacher_id)?,
        })
    }

    pub(crate) fn conflicts(&self, candidate: &CandidateSlot, window: DateWindow) -> SlotConflicts {
        collect_conflicts(candidate, window, &self.templates, &self.slots, &self.blocks)
    }

    /// Busy ranges on `target`; weekly targets only see slots in `window`.
    fn busy(&self, target: &SlotTarget, window: DateWindow) -> Vec<TimeRange> {
        match target {
            SlotTarget::Date(_) => busy_ranges(target, &self.templates, &self.slots, &self.blocks),
            SlotTarget::Weekly(_) => {
                let in_window: Vec<ScheduleSlot> = self
                    .slots
                    .iter()
                    .filter(|s| window.contains(s.date))
                    .cloned()
                    .collect();
                busy_ranges(target, &self.templates, &in_window, &self.blocks)
            }
        }
    }
}

const SLOT_COLUMNS: &str = "id, teacher_id, date, start_time, end_time, duration_minutes, status, student_id, subject, is_recurring, template_id, is_override, created_at";

struct SlotRow {
    id: String,
    teacher_id: String,
    date: String,
    start_time: String,
    end_time: String,
    duration_minutes: i64,
    status: String,
    student_id: Option<String>,
    subject: Option<String>,
    is_recurring: bool,
    template_id: Option<String>,
    is_override: bool,
    created_at: String,
}

fn read_slot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRow> {
    Ok(SlotRow {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        date: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        duration_minutes: row.get(5)?,
        status: row.get(6)?,
        student_id: row.get(7)?,
        subject: row.get(8)?,
        is_recurring: row.get(9)?,
        template_id: row.get(10)?,
        is_override: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Rebuilds a stored range; rows are validated on write.
fn stored_range(start: &str, end: &str, row_id: &str) -> Result<TimeRange, DbError> {
    TimeRange::new(parse_time(start, row_id)?, parse_time(end, row_id)?).map_err(|err| {
        DbError::InvalidRow {
            row_id: row_id.to_string(),
            message: err.to_string(),
        }
    })
}

impl SlotRow {
    fn decode(self) -> Result<ScheduleSlot, DbError> {
        let id = self.id;
        Ok(ScheduleSlot {
            date: parse_date(&self.date, &id)?,
            time: stored_range(&self.start_time, &self.end_time, &id)?,
            status: parse_enum(&self.status, &id)?,
            created_at: parse_timestamp(&self.created_at, &id)?,
            teacher_id: self.teacher_id,
            duration_minutes: self.duration_minutes,
            student_id: self.student_id,
            subject: self.subject,
            is_recurring: self.is_recurring,
            template_id: self.template_id,
            is_override: self.is_override,
            id,
        })
    }
}

pub(crate) fn query_slots(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ScheduleSlot>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SLOT_COLUMNS} FROM schedule_slots {filter} ORDER BY date ASC, start_time ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params, read_slot)?;
    let mut slots = Vec::new();
    for row in rows {
        slots.push(row?.decode()?);
    }
    Ok(slots)
}

pub(crate) fn load_slot(conn: &Connection, id: &str) -> Result<Option<ScheduleSlot>, DbError> {
    conn.query_row(
        &format!("SELECT {SLOT_COLUMNS} FROM schedule_slots WHERE id = ?"),
        [id],
        read_slot,
    )
    .optional()?
    .map(SlotRow::decode)
    .transpose()
}

const TEMPLATE_COLUMNS: &str = "id, teacher_id, day_of_week, start_time, end_time, subject, duration_minutes, is_available, is_recurring, recurrence_end_date, created_at";

type TemplateRow = (
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    i64,
    bool,
    bool,
    Option<String>,
    String,
);

fn read_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemplateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn decode_template(row: TemplateRow) -> Result<TimeSlotTemplate, DbError> {
    let (id, teacher_id, day, start, end, subject, duration, available, recurring, until, created) =
        row;
    Ok(TimeSlotTemplate {
        day_of_week: parse_weekday(day, &id)?,
        time: stored_range(&start, &end, &id)?,
        recurrence_end_date: until.map(|d| parse_date(&d, &id)).transpose()?,
        created_at: parse_timestamp(&created, &id)?,
        teacher_id,
        subject,
        duration_minutes: duration,
        is_available: available,
        is_recurring: recurring,
        id,
    })
}

pub(crate) fn teacher_templates(
    conn: &Connection,
    teacher_id: &str,
) -> Result<Vec<TimeSlotTemplate>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM time_slot_templates WHERE teacher_id = ? ORDER BY day_of_week ASC, start_time ASC, id ASC"
    ))?;
    let rows = stmt.query_map([teacher_id], read_template)?;
    let mut templates = Vec::new();
    for row in rows {
        templates.push(decode_template(row?)?);
    }
    Ok(templates)
}

pub(crate) fn load_template(
    conn: &Connection,
    id: &str,
) -> Result<Option<TimeSlotTemplate>, DbError> {
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLUMNS} FROM time_slot_templates WHERE id = ?"),
        [id],
        read_template,
    )
    .optional()?
    .map(decode_template)
    .transpose()
}

fn teacher_blocks(conn: &Connection, teacher_id: &str) -> Result<Vec<BlockedSlot>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT id, teacher_id, day_of_week, date, start_time, end_time, reason
        FROM blocked_slots
        WHERE teacher_id = ?
        ORDER BY id ASC
        ",
    )?;
    let rows = stmt.query_map([teacher_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<i64>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;
    let mut blocks = Vec::new();
    for row in rows {
        let (id, teacher_id, day, date, start, end, reason) = row?;
        blocks.push(BlockedSlot {
            day_of_week: day.map(|d| parse_weekday(d, &id)).transpose()?,
            date: date.map(|d| parse_date(&d, &id)).transpose()?,
            time: stored_range(&start, &end, &id)?,
            teacher_id,
            reason,
            id,
        });
    }
    Ok(blocks)
}

/// Fields for a new dated slot.
pub(crate) struct NewSlot<'a> {
    pub teacher_id: &'a str,
    pub date: NaiveDate,
    pub time: TimeRange,
    pub subject: Option<&'a str>,
    pub template_id: Option<&'a str>,
    /// Materialized from a recurring request.
    pub recurring: bool,
    pub is_override: bool,
}

pub(crate) fn insert_slot(
    conn: &Connection,
    slot: &NewSlot<'_>,
    now: DateTime<Utc>,
) -> Result<ScheduleSlot, DbError> {
    let id = new_id();
    conn.execute(
        "
        INSERT INTO schedule_slots
            (id, teacher_id, date, start_time, end_time, duration_minutes, status, subject,
             is_recurring, template_id, is_override, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'available', ?, ?, ?, ?, ?)
        ",
        params![
            id,
            slot.teacher_id,
            format_date(slot.date),
            format_time(slot.time.start),
            format_time(slot.time.end),
            slot.time.minutes(),
            slot.subject,
            slot.recurring,
            slot.template_id,
            slot.is_override,
            format_timestamp(now),
        ],
    )?;
    Ok(ScheduleSlot {
        id,
        teacher_id: slot.teacher_id.to_string(),
        date: slot.date,
        time: slot.time,
        duration_minutes: slot.time.minutes(),
        status: SlotStatus::Available,
        student_id: None,
        subject: slot.subject.map(str::to_string),
        is_recurring: slot.recurring,
        template_id: slot.template_id.map(str::to_string),
        is_override: slot.is_override,
        created_at: now,
    })
}

/// Fields for a new weekly template.
pub(crate) struct NewTemplate<'a> {
    pub teacher_id: &'a str,
    pub day_of_week: Weekday,
    pub time: TimeRange,
    pub subject: Option<&'a str>,
    pub recurrence_end_date: Option<NaiveDate>,
}

pub(crate) fn insert_template(
    conn: &Connection,
    template: &NewTemplate<'_>,
    now: DateTime<Utc>,
) -> Result<TimeSlotTemplate, DbError> {
    let id = new_id();
    conn.execute(
        "
        INSERT INTO time_slot_templates
            (id, teacher_id, day_of_week, start_time, end_time, subject, duration_minutes,
             is_available, is_recurring, recurrence_end_date, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 1, 1, ?, ?)
        ",
        params![
            id,
            template.teacher_id,
            format_weekday(template.day_of_week),
            format_time(template.time.start),
            format_time(template.time.end),
            template.subject,
            template.time.minutes(),
            template.recurrence_end_date.map(format_date),
            format_timestamp(now),
        ],
    )?;
    Ok(TimeSlotTemplate {
        id,
        teacher_id: template.teacher_id.to_string(),
        day_of_week: template.day_of_week,
        time: template.time,
        subject: template.subject.map(str::to_string),
        duration_minutes: template.time.minutes(),
        is_available: true,
        is_recurring: true,
        recurrence_end_date: template.recurrence_end_date,
        created_at: now,
    })
}

fn create_for_target(
    conn: &Connection,
    teacher_id: &str,
    candidate: &CandidateSlot,
    subject: Option<&str>,
    is_override: bool,
    now: DateTime<Utc>,
) -> Result<CreatedSlot, DbError> {
    match candidate.target {
        SlotTarget::Date(date) => insert_slot(
            conn,
            &NewSlot {
                teacher_id,
                date,
                time: candidate.time,
                subject,
                template_id: None,
                recurring: false,
                is_override,
            },
            now,
        )
        .map(CreatedSlot::Slot),
        SlotTarget::Weekly(day_of_week) => insert_template(
            conn,
            &NewTemplate {
                teacher_id,
                day_of_week,
                time: candidate.time,
                subject,
                recurrence_end_date: None,
            },
            now,
        )
        .map(CreatedSlot::Template),
    }
}

fn owned_slot(conn: &Connection, slot_id: &str) -> Result<ScheduleSlot, DbError> {
    load_slot(conn, slot_id)?.ok_or_else(|| DbError::not_found("slot", slot_id))
}

fn invalid_slot_state(slot: &ScheduleSlot, expected: &'static str) -> DbError {
    ValidationError::InvalidState {
        entity: "slot",
        id: slot.id.clone(),
        status: slot.status.to_string(),
        expected,
    }
    .into()
}

impl Database {
    /// Candidates that collide with the teacher's schedule. Conflict-free
    /// candidates are left out.
    pub fn check_conflicts(
        &self,
        teacher_id: &str,
        candidates: &[CandidateSlot],
        window: DateWindow,
    ) -> Result<Vec<SlotConflicts>, DbError> {
        require_non_empty("teacher id", teacher_id)?;
        let schedule = TeacherSchedule::load(&self.conn, teacher_id)?;
        Ok(candidates
            .iter()
            .map(|candidate| schedule.conflicts(candidate, window))
            .filter(|conflicts| !conflicts.is_empty())
            .collect())
    }

    /// Applies `strategy` to one candidate.
    ///
    /// Creating strategies re-check and write inside one immediate
    /// transaction, so the alternative they pick is still free when written.
    pub fn resolve_conflict(
        &mut self,
        teacher_id: &str,
        candidate: &CandidateSlot,
        strategy: Strategy,
        preferences: &Preferences,
        window: DateWindow,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome, DbError> {
        require_non_empty("teacher id", teacher_id)?;
        preferences.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let schedule = TeacherSchedule::load(&tx, teacher_id)?;
        let conflicts = schedule.conflicts(candidate, window);

        let outcome = match strategy {
            Strategy::SuggestAlternatives if conflicts.is_empty() => ResolveOutcome::NoConflict {
                candidate: *candidate,
            },
            Strategy::SuggestAlternatives => {
                let suggestions = suggest_alternatives(candidate, preferences, |target| {
                    schedule.busy(target, window)
                })?;
                ResolveOutcome::Suggestions {
                    conflicts,
                    suggestions,
                }
            }
            Strategy::AutoAdjust if conflicts.is_empty() => ResolveOutcome::Created {
                created: create_for_target(&tx, teacher_id, candidate, None, false, now)?,
                adjusted: None,
            },
            Strategy::AutoAdjust => {
                let suggestions = suggest_alternatives(candidate, preferences, |target| {
                    schedule.busy(target, window)
                })?;
                let Some(best) = best_alternative(&suggestions) else {
                    return Err(DbError::NoAlternative {
                        candidate: format!("{:?} {}", candidate.target, candidate.time),
                    });
                };
                let created =
                    create_for_target(&tx, teacher_id, &best.to_candidate(), None, false, now)?;
                ResolveOutcome::Created {
                    created,
                    adjusted: Some(best),
                }
            }
            Strategy::ForceOverride => ResolveOutcome::Created {
                created: create_for_target(
                    &tx,
                    teacher_id,
                    candidate,
                    None,
                    !conflicts.is_empty(),
                    now,
                )?,
                adjusted: None,
            },
        };
        tx.commit()?;
        debug!(teacher_id, strategy = %strategy, "conflict resolved");
        Ok(outcome)
    }

    /// Creates one slot (or weekly template) if it is conflict-free.
    pub fn create_slot(
        &mut self,
        teacher_id: &str,
        candidate: &CandidateSlot,
        subject: Option<&str>,
        window: DateWindow,
        now: DateTime<Utc>,
    ) -> Result<CreatedSlot, DbError> {
        require_non_empty("teacher id", teacher_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let conflicts = TeacherSchedule::load(&tx, teacher_id)?.conflicts(candidate, window);
        if !conflicts.is_empty() {
            return Err(DbError::SlotConflicts(vec![conflicts]));
        }
        let created = create_for_target(&tx, teacher_id, candidate, subject, false, now)?;
        tx.commit()?;
        info!(teacher_id, "slot created");
        Ok(created)
    }

    /// Books an available slot for a student, holding one credit hour.
    ///
    /// Only one of several racing bookings wins; the others get a conflict.
    pub fn book_slot(
        &mut self,
        slot_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, DbError> {
        require_non_empty("student id", student_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let slot = owned_slot(&tx, slot_id)?;
        if slot.status != SlotStatus::Available {
            return Err(DbError::conflict(
                format!("slot is {}", slot.status),
                slot.id,
            ));
        }

        let account: Option<(String, f64)> = tx
            .query_row(
                "SELECT id, balance_hours FROM credit_accounts WHERE student_id = ? AND teacher_id = ?",
                params![student_id, slot.teacher_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let account_id = match account {
            Some((id, balance)) if balance + HOURS_EPSILON >= BOOKING_CREDIT_HOURS => id,
            Some((_, balance)) => {
                return Err(ValidationError::OutOfRange {
                    field: "credit balance",
                    message: format!("booking needs {BOOKING_CREDIT_HOURS} hour(s), {balance} available"),
                }
                .into());
            }
            None => {
                return Err(ValidationError::OutOfRange {
                    field: "credit balance",
                    message: "no credit account for this teacher".to_string(),
                }
                .into());
            }
        };

        let updated = tx.execute(
            "UPDATE schedule_slots SET status = 'booked', student_id = ? WHERE id = ? AND status = 'available'",
            params![student_id, slot_id],
        )?;
        if updated != 1 {
            return Err(DbError::conflict("slot was booked by someone else", slot_id));
        }
        let hours = BOOKING_CREDIT_HOURS;
        let balance_after =
            adjust_balance(&tx, &account_id, TransactionKind::Deduction, hours, now)?;
        let transaction = append_transaction(
            &tx,
            LedgerEntry {
                account_id: &account_id,
                kind: TransactionKind::Deduction,
                hours,
                balance_after,
                reference_type: Some(ReferenceType::SlotBooking),
                reference_id: Some(slot_id),
                description: Some(format!("Booked slot on {}", format_date(slot.date))),
            },
            now,
        )?;
        let slot = owned_slot(&tx, slot_id)?;
        tx.commit()?;

        info!(slot_id, student_id, "slot booked");
        Ok(BookingOutcome { slot, transaction })
    }

    /// Cancels a booking, returns its credit and offers the time to the
    /// waitlist.
    pub fn cancel_booking(
        &mut self,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let slot = owned_slot(&tx, slot_id)?;
        if slot.status != SlotStatus::Booked {
            return Err(invalid_slot_state(&slot, "booked"));
        }
        let updated = tx.execute(
            "UPDATE schedule_slots SET status = 'cancelled' WHERE id = ? AND status = 'booked'",
            [slot_id],
        )?;
        if updated != 1 {
            return Err(DbError::conflict("slot changed concurrently", slot_id));
        }

        let refund = match booking_debit(&tx, slot_id)? {
            Some((account_id, hours)) => {
                let balance_after =
                    adjust_balance(&tx, &account_id, TransactionKind::Refund, hours, now)?;
                Some(append_transaction(
                    &tx,
                    LedgerEntry {
                        account_id: &account_id,
                        kind: TransactionKind::Refund,
                        hours,
                        balance_after,
                        reference_type: Some(ReferenceType::SlotBooking),
                        reference_id: Some(slot_id),
                        description: Some("Booking cancelled".to_string()),
                    },
                    now,
                )?)
            }
            None => None,
        };

        let by_slot = WaitlistTarget::Slot {
            slot_id: slot_id.to_string(),
        };
        let by_window = WaitlistTarget::Window {
            day_of_week: slot.weekday(),
            time: slot.time,
        };
        let notified = match notify_next_in(&tx, &slot.teacher_id, &by_slot, now)? {
            Some(entry) => Some(entry),
            None => notify_next_in(&tx, &slot.teacher_id, &by_window, now)?,
        };
        let slot = owned_slot(&tx, slot_id)?;
        tx.commit()?;

        info!(slot_id, refunded = refund.is_some(), "booking cancelled");
        Ok(CancellationOutcome {
            slot,
            refund,
            notified,
        })
    }

    /// Marks a booked slot as taught.
    pub fn complete_slot(&mut self, slot_id: &str) -> Result<ScheduleSlot, DbError> {
        let tx = self.conn.transaction()?;
        let slot = owned_slot(&tx, slot_id)?;
        if slot.status != SlotStatus::Booked {
            return Err(invalid_slot_state(&slot, "booked"));
        }
        tx.execute(
            "UPDATE schedule_slots SET status = 'completed' WHERE id = ? AND status = 'booked'",
            [slot_id],
        )?;
        let slot = owned_slot(&tx, slot_id)?;
        tx.commit()?;
        Ok(slot)
    }

    /// Marks a weekly or one-off range unavailable.
    pub fn block_time(
        &mut self,
        teacher_id: &str,
        target: SlotTarget,
        time: TimeRange,
        reason: Option<&str>,
    ) -> Result<BlockedSlot, DbError> {
        require_non_empty("teacher id", teacher_id)?;
        let (day_of_week, date) = match target {
            SlotTarget::Weekly(day) => (Some(day), None),
            SlotTarget::Date(date) => (None, Some(date)),
        };
        let id = new_id();
        self.conn.execute(
            "
            INSERT INTO blocked_slots (id, teacher_id, day_of_week, date, start_time, end_time, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                id,
                teacher_id,
                day_of_week.map(format_weekday),
                date.map(format_date),
                format_time(time.start),
                format_time(time.end),
                reason,
            ],
        )?;
        Ok(BlockedSlot {
            id,
            teacher_id: teacher_id.to_string(),
            day_of_week,
            date,
            time,
            reason: reason.map(str::to_string),
        })
    }

    pub fn slot(&self, id: &str) -> Result<Option<ScheduleSlot>, DbError> {
        load_slot(&self.conn, id)
    }

    /// The teacher's slots dated within `window`.
    pub fn list_slots(
        &self,
        teacher_id: &str,
        window: DateWindow,
    ) -> Result<Vec<ScheduleSlot>, DbError> {
        query_slots(
            &self.conn,
            "WHERE teacher_id = ? AND date >= ? AND date <= ?",
            params![teacher_id, format_date(window.from), format_date(window.to)],
        )
    }

    pub fn list_templates(&self, teacher_id: &str) -> Result<Vec<TimeSlotTemplate>, DbError> {
        teacher_templates(&self.conn, teacher_id)
    }

    pub fn list_blocks(&self, teacher_id: &str) -> Result<Vec<BlockedSlot>, DbError> {
        teacher_blocks(&self.conn, teacher_id)
    }
}

/// Net hours still held by the slot's booking, and the account holding them.
pub(crate) fn booking_debit(conn: &Connection, slot_id: &str) -> Result<Option<(String, f64)>, DbError> {
    let row: Option<(String, f64)> = conn
        .query_row(
            "
            SELECT account_id,
                   SUM(CASE type WHEN 'deduction' THEN hours_amount ELSE -hours_amount END)
            FROM credit_transactions
            WHERE reference_type = 'slot_booking' AND reference_id = ?
            GROUP BY account_id
            ",
            [slot_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.filter(|(_, hours)| *hours > HOURS_EPSILON))
}
