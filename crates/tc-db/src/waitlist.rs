//! Waitlist storage: joining, queue position, notification and expiry.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use serde::Serialize;
use tc_core::time_range::{TimeRange, format_time};
use tc_core::types::{SlotStatus, ValidationError, WaitlistStatus, require_non_empty};
use tc_core::waitlist::{
    JOIN_EXPIRY, NOTIFY_EXPIRY, WaitlistAction, WaitlistEntry, WaitlistTarget, next_in_queue,
    queue_position,
};
use tracing::{debug, info};

use crate::slots::{TeacherSchedule, load_slot};
use crate::{
    Database, DbError, format_timestamp, format_weekday, new_id, parse_enum,
    parse_optional_timestamp, parse_time, parse_timestamp, parse_weekday,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub entry: WaitlistEntry,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManageOutcome {
    /// The entry as it was left; for `remove`, as it was before deletion.
    pub entry: WaitlistEntry,
    pub removed: bool,
}

const ENTRY_COLUMNS: &str = "id, teacher_id, student_id, slot_id, day_of_week, start_time, end_time, status, priority, created_at, expires_at, notified_at";

struct EntryRow {
    id: String,
    teacher_id: String,
    student_id: String,
    slot_id: Option<String>,
    day_of_week: Option<i64>,
    start_time: Option<String>,
    end_time: Option<String>,
    status: String,
    priority: i32,
    created_at: String,
    expires_at: String,
    notified_at: Option<String>,
}

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        student_id: row.get(2)?,
        slot_id: row.get(3)?,
        day_of_week: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        status: row.get(7)?,
        priority: row.get(8)?,
        created_at: row.get(9)?,
        expires_at: row.get(10)?,
        notified_at: row.get(11)?,
    })
}

impl EntryRow {
    fn decode(self) -> Result<WaitlistEntry, DbError> {
        let id = self.id;
        let target = match (self.slot_id, self.day_of_week, self.start_time, self.end_time) {
            (Some(slot_id), _, _, _) => WaitlistTarget::Slot { slot_id },
            (None, Some(day), Some(start), Some(end)) => WaitlistTarget::Window {
                day_of_week: parse_weekday(day, &id)?,
                time: TimeRange::new(parse_time(&start, &id)?, parse_time(&end, &id)?)
                    .map_err(|err| DbError::InvalidRow {
                        row_id: id.clone(),
                        message: err.to_string(),
                    })?,
            },
            _ => {
                return Err(DbError::InvalidRow {
                    row_id: id,
                    message: "waitlist entry has neither a slot nor a window".to_string(),
                });
            }
        };
        Ok(WaitlistEntry {
            target,
            status: parse_enum(&self.status, &id)?,
            created_at: parse_timestamp(&self.created_at, &id)?,
            expires_at: parse_timestamp(&self.expires_at, &id)?,
            notified_at: parse_optional_timestamp(self.notified_at.as_deref(), &id)?,
            teacher_id: self.teacher_id,
            student_id: self.student_id,
            priority: self.priority,
            id,
        })
    }
}

/// SQL predicate and bound values selecting one queue.
fn queue_filter(teacher_id: &str, target: &WaitlistTarget) -> (&'static str, Vec<Value>) {
    match target {
        WaitlistTarget::Slot { slot_id } => (
            "teacher_id = ? AND slot_id = ?",
            vec![teacher_id.to_string().into(), slot_id.clone().into()],
        ),
        WaitlistTarget::Window { day_of_week, time } => (
            "teacher_id = ? AND slot_id IS NULL AND day_of_week = ? AND start_time = ? AND end_time = ?",
            vec![
                teacher_id.to_string().into(),
                format_weekday(*day_of_week).into(),
                format_time(time.start).into(),
                format_time(time.end).into(),
            ],
        ),
    }
}

fn queue_entries(
    conn: &Connection,
    teacher_id: &str,
    target: &WaitlistTarget,
) -> Result<Vec<WaitlistEntry>, DbError> {
    let (filter, values) = queue_filter(teacher_id, target);
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE {filter} ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params_from_iter(values), read_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.decode()?);
    }
    Ok(entries)
}

fn load_entry(conn: &Connection, id: &str) -> Result<Option<WaitlistEntry>, DbError> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE id = ?"),
        [id],
        read_entry,
    )
    .optional()?
    .map(EntryRow::decode)
    .transpose()
}

fn require_entry(conn: &Connection, id: &str) -> Result<WaitlistEntry, DbError> {
    load_entry(conn, id)?.ok_or_else(|| DbError::not_found("waitlist entry", id))
}

fn invalid_entry_state(entry: &WaitlistEntry, expected: &'static str) -> DbError {
    ValidationError::InvalidState {
        entity: "waitlist entry",
        id: entry.id.clone(),
        status: entry.status.to_string(),
        expected,
    }
    .into()
}

/// Rejects joins for time that is still free to book.
fn ensure_target_full(
    conn: &Connection,
    teacher_id: &str,
    target: &WaitlistTarget,
) -> Result<(), DbError> {
    match target {
        WaitlistTarget::Slot { slot_id } => {
            let slot = load_slot(conn, slot_id)?
                .filter(|slot| slot.teacher_id == teacher_id)
                .ok_or_else(|| DbError::not_found("slot", slot_id.as_str()))?;
            if slot.status != SlotStatus::Booked {
                return Err(ValidationError::InvalidState {
                    entity: "slot",
                    id: slot.id,
                    status: slot.status.to_string(),
                    expected: "booked",
                }
                .into());
            }
        }
        WaitlistTarget::Window { day_of_week, time } => {
            let schedule = TeacherSchedule::load(conn, teacher_id)?;
            let occupied = schedule
                .templates
                .iter()
                .any(|t| t.is_available && t.day_of_week == *day_of_week && t.time.overlaps(time))
                || schedule.slots.iter().any(|s| {
                    s.status == SlotStatus::Booked
                        && s.weekday() == *day_of_week
                        && s.time.overlaps(time)
                })
                || schedule
                    .blocks
                    .iter()
                    .any(|b| b.day_of_week == Some(*day_of_week) && b.time.overlaps(time));
            if !occupied {
                return Err(ValidationError::InvalidValue {
                    field: "waitlist window",
                    value: format!("{day_of_week} {time} still has free time"),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Offers the target to the head of its queue inside the caller's
/// transaction. Overdue entries are passed over.
pub(crate) fn notify_next_in(
    conn: &Connection,
    teacher_id: &str,
    target: &WaitlistTarget,
    now: DateTime<Utc>,
) -> Result<Option<WaitlistEntry>, DbError> {
    let entries: Vec<WaitlistEntry> = queue_entries(conn, teacher_id, target)?
        .into_iter()
        .filter(|entry| !entry.is_overdue(now))
        .collect();
    let Some(head) = next_in_queue(&entries) else {
        return Ok(None);
    };
    mark_notified(conn, head, now).map(Some)
}

fn mark_notified(
    conn: &Connection,
    entry: &WaitlistEntry,
    now: DateTime<Utc>,
) -> Result<WaitlistEntry, DbError> {
    let expires_at = now + NOTIFY_EXPIRY;
    let updated = conn.execute(
        "
        UPDATE waitlist_entries
        SET status = 'notified', notified_at = ?, expires_at = ?
        WHERE id = ? AND status = 'waiting'
        ",
        params![format_timestamp(now), format_timestamp(expires_at), entry.id],
    )?;
    if updated != 1 {
        return Err(DbError::conflict("waitlist entry changed concurrently", entry.id.as_str()));
    }
    info!(entry_id = %entry.id, student_id = %entry.student_id, "waitlist entry notified");
    Ok(WaitlistEntry {
        status: WaitlistStatus::Notified,
        notified_at: Some(now),
        expires_at,
        ..entry.clone()
    })
}

impl Database {
    /// Queues a student for a full slot or weekly window.
    ///
    /// A second `waiting` entry for the same queue is a conflict carrying the
    /// existing entry's id.
    pub fn join_waitlist_at(
        &mut self,
        teacher_id: &str,
        student_id: &str,
        target: &WaitlistTarget,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, DbError> {
        require_non_empty("teacher id", teacher_id)?;
        require_non_empty("student id", student_id)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let queue = queue_entries(&tx, teacher_id, target)?;
        if let Some(existing) = queue
            .iter()
            .find(|e| e.student_id == student_id && e.status == WaitlistStatus::Waiting)
        {
            return Err(DbError::conflict(
                "student is already waiting for this time",
                existing.id.as_str(),
            ));
        }
        ensure_target_full(&tx, teacher_id, target)?;

        let entry = WaitlistEntry {
            id: new_id(),
            teacher_id: teacher_id.to_string(),
            student_id: student_id.to_string(),
            target: target.clone(),
            status: WaitlistStatus::Waiting,
            priority,
            created_at: now,
            expires_at: now + JOIN_EXPIRY,
            notified_at: None,
        };
        let (slot_id, day, start, end) = match &entry.target {
            WaitlistTarget::Slot { slot_id } => (Some(slot_id.as_str()), None, None, None),
            WaitlistTarget::Window { day_of_week, time } => (
                None,
                Some(format_weekday(*day_of_week)),
                Some(format_time(time.start)),
                Some(format_time(time.end)),
            ),
        };
        tx.execute(
            "
            INSERT INTO waitlist_entries
                (id, teacher_id, student_id, slot_id, day_of_week, start_time, end_time,
                 status, priority, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'waiting', ?, ?, ?)
            ",
            params![
                entry.id,
                entry.teacher_id,
                entry.student_id,
                slot_id,
                day,
                start,
                end,
                entry.priority,
                format_timestamp(entry.created_at),
                format_timestamp(entry.expires_at),
            ],
        )?;
        let mut queue = queue;
        queue.push(entry.clone());
        let position = queue_position(&entry, &queue);
        tx.commit()?;

        info!(entry_id = %entry.id, teacher_id, student_id, position, "joined waitlist");
        Ok(JoinOutcome { entry, position })
    }

    pub fn waitlist_entry(&self, id: &str) -> Result<Option<WaitlistEntry>, DbError> {
        load_entry(&self.conn, id)
    }

    /// 1-based place of a `waiting` entry in its queue.
    pub fn waitlist_position(&self, id: &str) -> Result<usize, DbError> {
        let entry = require_entry(&self.conn, id)?;
        if entry.status != WaitlistStatus::Waiting {
            return Err(invalid_entry_state(&entry, "waiting"));
        }
        let queue = queue_entries(&self.conn, &entry.teacher_id, &entry.target)?;
        Ok(queue_position(&entry, &queue))
    }

    /// Every entry for the teacher, oldest first.
    pub fn list_waitlist(&self, teacher_id: &str) -> Result<Vec<WaitlistEntry>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE teacher_id = ? ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([teacher_id], read_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.decode()?);
        }
        Ok(entries)
    }

    /// Offers the target to the head of its queue.
    pub fn notify_next(
        &mut self,
        teacher_id: &str,
        target: &WaitlistTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let notified = notify_next_in(&tx, teacher_id, target, now)?;
        tx.commit()?;
        if notified.is_none() {
            debug!(teacher_id, "waitlist queue is empty");
        }
        Ok(notified)
    }

    pub fn manage_waitlist(
        &mut self,
        id: &str,
        action: WaitlistAction,
        now: DateTime<Utc>,
    ) -> Result<ManageOutcome, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = require_entry(&tx, id)?;
        let open = matches!(
            entry.status,
            WaitlistStatus::Waiting | WaitlistStatus::Notified
        );

        let outcome = match action {
            WaitlistAction::Notify => {
                if entry.status != WaitlistStatus::Waiting {
                    return Err(invalid_entry_state(&entry, "waiting"));
                }
                ManageOutcome {
                    entry: mark_notified(&tx, &entry, now)?,
                    removed: false,
                }
            }
            WaitlistAction::Fulfill => {
                if !open {
                    return Err(invalid_entry_state(&entry, "waiting or notified"));
                }
                tx.execute(
                    "UPDATE waitlist_entries SET status = 'fulfilled' WHERE id = ?",
                    [id],
                )?;
                ManageOutcome {
                    entry: WaitlistEntry {
                        status: WaitlistStatus::Fulfilled,
                        ..entry
                    },
                    removed: false,
                }
            }
            WaitlistAction::Remove => {
                tx.execute("DELETE FROM waitlist_entries WHERE id = ?", [id])?;
                ManageOutcome {
                    entry,
                    removed: true,
                }
            }
            WaitlistAction::Extend { hours } => {
                tc_core::waitlist::validate_extend_hours(hours)?;
                if !open {
                    return Err(invalid_entry_state(&entry, "waiting or notified"));
                }
                let expires_at = entry.expires_at.max(now) + Duration::hours(hours);
                tx.execute(
                    "UPDATE waitlist_entries SET expires_at = ? WHERE id = ?",
                    params![format_timestamp(expires_at), id],
                )?;
                ManageOutcome {
                    entry: WaitlistEntry {
                        expires_at,
                        ..entry
                    },
                    removed: false,
                }
            }
        };
        tx.commit()?;
        debug!(entry_id = id, ?action, "waitlist entry updated");
        Ok(outcome)
    }

    /// Marks overdue `waiting` and `notified` entries `expired`.
    pub fn expire_waitlist(&mut self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let expired = self.conn.execute(
            "
            UPDATE waitlist_entries
            SET status = 'expired'
            WHERE status IN ('waiting', 'notified') AND expires_at <= ?
            ",
            [format_timestamp(now)],
        )?;
        if expired > 0 {
            info!(expired, "waitlist entries expired");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreditPurchase;
    use crate::slots::CreatedSlot;
    use chrono::{NaiveDate, TimeZone, Weekday};
    use tc_core::conflict::DateWindow;
    use tc_core::slot::{CandidateSlot, SlotTarget};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    fn later(minutes: i64) -> DateTime<Utc> {
        now() + Duration::minutes(minutes)
    }

    /// A Monday 10:00-11:00 slot booked by `s-booked`.
    fn booked_slot(db: &mut Database) -> String {
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let candidate = CandidateSlot {
            target: SlotTarget::Date(monday),
            time: TimeRange::parse("10:00", "11:00").unwrap(),
        };
        let CreatedSlot::Slot(slot) = db
            .create_slot("t-1", &candidate, None, DateWindow::lookahead(monday), now())
            .unwrap()
        else {
            panic!("expected a dated slot");
        };
        db.purchase_credits_at(
            &CreditPurchase {
                student_id: "s-booked".to_string(),
                teacher_id: "t-1".to_string(),
                parent_id: None,
                hours: 2.0,
                rate_per_hour: None,
                payment_reference: None,
            },
            now(),
        )
        .unwrap();
        db.book_slot(&slot.id, "s-booked", now()).unwrap();
        slot.id
    }

    fn slot_target(slot_id: &str) -> WaitlistTarget {
        WaitlistTarget::Slot {
            slot_id: slot_id.to_string(),
        }
    }

    #[test]
    fn positions_follow_priority_then_arrival() {
        let mut db = Database::open_in_memory().unwrap();
        let target = slot_target(&booked_slot(&mut db));

        let a = db.join_waitlist_at("t-1", "s-a", &target, 0, later(1)).unwrap();
        let b = db.join_waitlist_at("t-1", "s-b", &target, 0, later(2)).unwrap();
        let c = db.join_waitlist_at("t-1", "s-c", &target, 5, later(3)).unwrap();
        assert_eq!((a.position, b.position, c.position), (1, 2, 1));

        assert_eq!(db.waitlist_position(&c.entry.id).unwrap(), 1);
        assert_eq!(db.waitlist_position(&a.entry.id).unwrap(), 2);
        assert_eq!(db.waitlist_position(&b.entry.id).unwrap(), 3);
    }

    #[test]
    fn duplicate_join_is_a_conflict() {
        let mut db = Database::open_in_memory().unwrap();
        let target = slot_target(&booked_slot(&mut db));
        let first = db.join_waitlist_at("t-1", "s-a", &target, 0, now()).unwrap();
        match db.join_waitlist_at("t-1", "s-a", &target, 0, now()) {
            Err(DbError::Conflict { existing_id, .. }) => {
                assert_eq!(existing_id.as_deref(), Some(first.entry.id.as_str()));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn joining_free_time_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let candidate = CandidateSlot {
            target: SlotTarget::Date(monday),
            time: TimeRange::parse("14:00", "15:00").unwrap(),
        };
        let CreatedSlot::Slot(open_slot) = db
            .create_slot("t-1", &candidate, None, DateWindow::lookahead(monday), now())
            .unwrap()
        else {
            panic!("expected a dated slot");
        };
        assert!(matches!(
            db.join_waitlist_at("t-1", "s-a", &slot_target(&open_slot.id), 0, now()),
            Err(DbError::Validation(_))
        ));

        let window = WaitlistTarget::Window {
            day_of_week: Weekday::Tue,
            time: TimeRange::parse("10:00", "11:00").unwrap(),
        };
        assert!(matches!(
            db.join_waitlist_at("t-1", "s-a", &window, 0, now()),
            Err(DbError::Validation(_))
        ));
        assert!(db.list_waitlist("t-1").unwrap().is_empty());
    }

    #[test]
    fn cancellation_notifies_head_of_queue() {
        let mut db = Database::open_in_memory().unwrap();
        let slot_id = booked_slot(&mut db);
        let target = slot_target(&slot_id);
        let first = db.join_waitlist_at("t-1", "s-a", &target, 0, later(1)).unwrap();
        let second = db.join_waitlist_at("t-1", "s-b", &target, 0, later(2)).unwrap();

        let cancelled = db.cancel_booking(&slot_id, later(10)).unwrap();
        let notified = cancelled.notified.unwrap();
        assert_eq!(notified.id, first.entry.id);
        assert_eq!(notified.status, WaitlistStatus::Notified);
        assert_eq!(notified.expires_at, later(10) + NOTIFY_EXPIRY);

        // The notified entry leaves the ordering.
        assert_eq!(db.waitlist_position(&second.entry.id).unwrap(), 1);
        let next = db.notify_next("t-1", &target, later(20)).unwrap().unwrap();
        assert_eq!(next.id, second.entry.id);
        assert!(db.notify_next("t-1", &target, later(30)).unwrap().is_none());
    }

    #[test]
    fn window_target_joins_when_template_holds_the_time() {
        let mut db = Database::open_in_memory().unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        db.create_slot(
            "t-1",
            &CandidateSlot {
                target: SlotTarget::Weekly(Weekday::Wed),
                time: TimeRange::parse("16:00", "17:00").unwrap(),
            },
            None,
            DateWindow::lookahead(monday),
            now(),
        )
        .unwrap();
        let window = WaitlistTarget::Window {
            day_of_week: Weekday::Wed,
            time: TimeRange::parse("16:00", "17:00").unwrap(),
        };
        let joined = db.join_waitlist_at("t-1", "s-a", &window, 0, now()).unwrap();
        assert_eq!(joined.entry.expires_at, now() + JOIN_EXPIRY);
        assert_eq!(db.waitlist_entry(&joined.entry.id).unwrap().unwrap(), joined.entry);
    }

    #[test]
    fn manage_actions_move_entry_state() {
        let mut db = Database::open_in_memory().unwrap();
        let target = slot_target(&booked_slot(&mut db));
        let a = db.join_waitlist_at("t-1", "s-a", &target, 0, now()).unwrap().entry;
        let b = db.join_waitlist_at("t-1", "s-b", &target, 0, now()).unwrap().entry;

        let extended = db
            .manage_waitlist(&a.id, WaitlistAction::Extend { hours: 24 }, now())
            .unwrap();
        assert_eq!(extended.entry.expires_at, a.expires_at + Duration::hours(24));
        assert!(matches!(
            db.manage_waitlist(&a.id, WaitlistAction::Extend { hours: 500 }, now()),
            Err(DbError::Validation(_))
        ));

        let notified = db.manage_waitlist(&a.id, WaitlistAction::Notify, now()).unwrap();
        assert_eq!(notified.entry.status, WaitlistStatus::Notified);
        assert!(db.manage_waitlist(&a.id, WaitlistAction::Notify, now()).is_err());

        let fulfilled = db.manage_waitlist(&a.id, WaitlistAction::Fulfill, now()).unwrap();
        assert_eq!(fulfilled.entry.status, WaitlistStatus::Fulfilled);

        let removed = db.manage_waitlist(&b.id, WaitlistAction::Remove, now()).unwrap();
        assert!(removed.removed);
        assert!(db.waitlist_entry(&b.id).unwrap().is_none());
        assert!(matches!(
            db.manage_waitlist(&b.id, WaitlistAction::Fulfill, now()),
            Err(DbError::NotFound { .. })
        ));
    }

    #[test]
    fn expiry_sweep_closes_overdue_entries() {
        let mut db = Database::open_in_memory().unwrap();
        let target = slot_target(&booked_slot(&mut db));
        let a = db.join_waitlist_at("t-1", "s-a", &target, 0, now()).unwrap().entry;
        db.join_waitlist_at("t-1", "s-b", &target, 0, now() + Duration::days(3))
            .unwrap();

        assert_eq!(db.expire_waitlist(now() + Duration::days(6)).unwrap(), 0);
        assert_eq!(db.expire_waitlist(now() + Duration::days(7)).unwrap(), 1);
        let stored = db.waitlist_entry(&a.id).unwrap().unwrap();
        assert_eq!(stored.status, WaitlistStatus::Expired);

        // An expired student may queue again.
        db.join_waitlist_at("t-1", "s-a", &target, 0, now() + Duration::days(8))
            .unwrap();
    }
}
