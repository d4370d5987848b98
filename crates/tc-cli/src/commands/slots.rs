//! Slot conflict checks, creation, bookings and reminders.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Duration;
use tc_core::conflict::{DateWindow, Preferences};
use tc_core::notify::log_delivery;
use tc_core::types::SlotStatus;
use serde::Serialize;
use tc_core::{BlockedSlot, CandidateSlot, Moment, Notifier, ScheduleSlot, TimeSlotTemplate};
use tc_db::{Database, DbError};
use tracing::info;

use super::util::{candidate, read_json, report_conflicts, write_json};
use crate::{Config, SlotsAction};

#[derive(Serialize)]
struct Schedule {
    slots: Vec<ScheduleSlot>,
    templates: Vec<TimeSlotTemplate>,
    blocks: Vec<BlockedSlot>,
}

/// Booked slots starting within `lead_minutes` of `now`.
pub fn due_for_reminder(slots: &[ScheduleSlot], now: &Moment, lead_minutes: i64) -> Vec<ScheduleSlot> {
    let local_now = now.utc.with_timezone(&now.offset).naive_local();
    let horizon = local_now + Duration::minutes(lead_minutes);
    slots
        .iter()
        .filter(|slot| slot.status == SlotStatus::Booked)
        .filter(|slot| {
            let start = slot.date.and_time(slot.time.start);
            start > local_now && start <= horizon
        })
        .cloned()
        .collect()
}

#[expect(
    clippy::too_many_lines,
    reason = "one arm per slots subcommand"
)]
pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &SlotsAction,
    config: &Config,
    notifier: &dyn Notifier,
    now: &Moment,
) -> Result<()> {
    let today = now.local_date();
    match action {
        SlotsAction::Check {
            teacher,
            file,
            from,
        } => {
            let candidates: Vec<CandidateSlot> = read_json(file)?;
            let window = DateWindow::lookahead(from.unwrap_or(today));
            let conflicts = db.check_conflicts(teacher, &candidates, window)?;
            write_json(writer, &conflicts)
        }
        SlotsAction::Resolve {
            teacher,
            placement,
            strategy,
            direction,
            max_adjustment,
            allow_day_change,
        } => {
            let candidate = candidate(placement)?;
            let preferences = Preferences {
                direction: *direction,
                max_adjustment_minutes: *max_adjustment,
                allow_day_change: *allow_day_change,
            };
            let outcome = db
                .resolve_conflict(
                    teacher,
                    &candidate,
                    *strategy,
                    &preferences,
                    DateWindow::lookahead(today),
                    now.utc,
                )
                .context("failed to resolve conflict")?;
            write_json(writer, &outcome)
        }
        SlotsAction::Create {
            teacher,
            placement,
            subject,
        } => {
            let candidate = candidate(placement)?;
            match db.create_slot(
                teacher,
                &candidate,
                subject.as_deref(),
                DateWindow::lookahead(today),
                now.utc,
            ) {
                Ok(created) => write_json(writer, &created),
                Err(DbError::SlotConflicts(conflicts)) => report_conflicts(writer, &conflicts),
                Err(err) => Err(err).context("failed to create slot"),
            }
        }
        SlotsAction::Book { slot_id, student } => {
            let booking = db
                .book_slot(slot_id, student, now.utc)
                .context("failed to book slot")?;
            log_delivery(
                notifier.booking_confirmation(&booking.slot.id, student),
                "booking_confirmation",
            );
            write_json(writer, &booking)
        }
        SlotsAction::Cancel { slot_id } => {
            let cancellation = db
                .cancel_booking(slot_id, now.utc)
                .context("failed to cancel booking")?;
            if let Some(student_id) = &cancellation.slot.student_id {
                log_delivery(
                    notifier.booking_cancellation(&cancellation.slot.id, student_id),
                    "booking_cancellation",
                );
            }
            if let Some(entry) = &cancellation.notified {
                log_delivery(
                    notifier.waitlist_notified(&entry.id, &entry.student_id, entry.expires_at),
                    "waitlist_notified",
                );
            }
            write_json(writer, &cancellation)
        }
        SlotsAction::Complete { slot_id } => {
            let slot = db.complete_slot(slot_id).context("failed to complete slot")?;
            write_json(writer, &slot)
        }
        SlotsAction::Block {
            teacher,
            placement,
            reason,
        } => {
            let candidate = candidate(placement)?;
            let block = db
                .block_time(teacher, candidate.target, candidate.time, reason.as_deref())
                .context("failed to block time")?;
            write_json(writer, &block)
        }
        SlotsAction::Remind { teacher } => {
            let lead = config.reminder_lead_minutes;
            let window = DateWindow {
                from: today,
                to: today + Duration::days(1),
            };
            let due = due_for_reminder(&db.list_slots(teacher, window)?, now, lead);
            for slot in &due {
                log_delivery(notifier.class_reminder(&slot.id, lead), "class_reminder");
            }
            info!(teacher_id = %teacher, reminded = due.len(), "reminders sent");
            write_json(writer, &due)
        }
        SlotsAction::List { teacher, from } => {
            let schedule = Schedule {
                slots: db.list_slots(teacher, DateWindow::lookahead(from.unwrap_or(today)))?,
                templates: db.list_templates(teacher)?,
                blocks: db.list_blocks(teacher)?,
            };
            write_json(writer, &schedule)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlacementArgs;
    use crate::commands::test_support::{RecordingNotifier, buy, monday_morning};
    use chrono::NaiveDate;
    use serde_json::Value;
    use tc_core::WaitlistTarget;

    fn placement(date: NaiveDate, start: &str, end: &str) -> PlacementArgs {
        PlacementArgs {
            date: Some(date),
            day: None,
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()
    }

    fn exec(
        db: &mut Database,
        action: &SlotsAction,
        notifier: &RecordingNotifier,
        now: &Moment,
    ) -> Result<Value> {
        let mut output = Vec::new();
        run(&mut output, db, action, &Config::default(), notifier, now)?;
        Ok(serde_json::from_slice(&output)?)
    }

    fn create(db: &mut Database, start: &str, end: &str) -> String {
        let created = exec(
            db,
            &SlotsAction::Create {
                teacher: "t1".to_string(),
                placement: placement(tuesday(), start, end),
                subject: Some("Maths".to_string()),
            },
            &RecordingNotifier::default(),
            &monday_morning(),
        )
        .unwrap();
        created["slot"]["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn overlapping_create_reports_conflicts() {
        let mut db = Database::open_in_memory().unwrap();
        create(&mut db, "10:00", "11:00");

        let mut output = Vec::new();
        let err = run(
            &mut output,
            &mut db,
            &SlotsAction::Create {
                teacher: "t1".to_string(),
                placement: placement(tuesday(), "10:30", "11:30"),
                subject: None,
            },
            &Config::default(),
            &RecordingNotifier::default(),
            &monday_morning(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 candidate(s) conflict"));
        let conflicts: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(conflicts[0]["slots"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn book_then_cancel_refunds_and_offers_to_waitlist() {
        let mut db = Database::open_in_memory().unwrap();
        buy(&mut db, "t1", "s1", 2.0);
        let slot_id = create(&mut db, "16:00", "17:00");
        let notifier = RecordingNotifier::default();
        let now = monday_morning();

        let booking = exec(
            &mut db,
            &SlotsAction::Book {
                slot_id: slot_id.clone(),
                student: "s1".to_string(),
            },
            &notifier,
            &now,
        )
        .unwrap();
        assert_eq!(booking["slot"]["status"], "booked");
        assert_eq!(booking["transaction"]["balance_after"], 1.0);

        db.join_waitlist_at(
            "t1",
            "s2",
            &WaitlistTarget::Slot {
                slot_id: slot_id.clone(),
            },
            0,
            now.utc,
        )
        .unwrap();

        let cancellation = exec(
            &mut db,
            &SlotsAction::Cancel {
                slot_id: slot_id.clone(),
            },
            &notifier,
            &now,
        )
        .unwrap();
        assert_eq!(cancellation["slot"]["status"], "cancelled");
        assert_eq!(cancellation["refund"]["kind"], "refund");
        assert_eq!(cancellation["notified"]["student_id"], "s2");
        assert_eq!(
            notifier.kinds(),
            vec!["booking_confirmation", "booking_cancellation", "waitlist_notified"]
        );

        let account = db.credit_account("s1", "t1").unwrap().unwrap();
        assert!((account.balance_hours - 2.0).abs() < 1e-9);
    }

    #[test]
    fn booking_without_credit_is_refused() {
        let mut db = Database::open_in_memory().unwrap();
        let slot_id = create(&mut db, "16:00", "17:00");
        let result = exec(
            &mut db,
            &SlotsAction::Book {
                slot_id,
                student: "s1".to_string(),
            },
            &RecordingNotifier::default(),
            &monday_morning(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn reminders_cover_booked_slots_inside_the_lead() {
        let mut db = Database::open_in_memory().unwrap();
        buy(&mut db, "t1", "s1", 5.0);
        let soon = create(&mut db, "09:30", "10:30");
        let later = create(&mut db, "13:00", "14:00");
        let notifier = RecordingNotifier::default();
        // Tuesday 09:00, so the 09:30 slot is 30 minutes out.
        let now = monday_morning().at(monday_morning().utc + Duration::hours(23));
        for slot_id in [&soon, &later] {
            exec(
                &mut db,
                &SlotsAction::Book {
                    slot_id: slot_id.clone(),
                    student: "s1".to_string(),
                },
                &RecordingNotifier::default(),
                &now,
            )
            .unwrap();
        }

        let due = exec(
            &mut db,
            &SlotsAction::Remind {
                teacher: "t1".to_string(),
            },
            &notifier,
            &now,
        )
        .unwrap();
        let due = due.as_array().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0]["id"], soon.as_str());
        assert_eq!(notifier.kinds(), vec!["class_reminder"]);
    }

    #[test]
    fn complete_requires_a_booking() {
        let mut db = Database::open_in_memory().unwrap();
        let slot_id = create(&mut db, "16:00", "17:00");
        let result = exec(
            &mut db,
            &SlotsAction::Complete { slot_id },
            &RecordingNotifier::default(),
            &monday_morning(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn list_shows_slots_and_blocks() {
        let mut db = Database::open_in_memory().unwrap();
        create(&mut db, "10:00", "11:00");
        exec(
            &mut db,
            &SlotsAction::Block {
                teacher: "t1".to_string(),
                placement: placement(tuesday(), "12:00", "13:00"),
                reason: Some("lunch".to_string()),
            },
            &RecordingNotifier::default(),
            &monday_morning(),
        )
        .unwrap();

        let schedule = exec(
            &mut db,
            &SlotsAction::List {
                teacher: "t1".to_string(),
                from: None,
            },
            &RecordingNotifier::default(),
            &monday_morning(),
        )
        .unwrap();
        assert_eq!(schedule["slots"].as_array().unwrap().len(), 1);
        assert!(schedule["templates"].as_array().unwrap().is_empty());
        assert_eq!(schedule["blocks"][0]["reason"], "lunch");
    }
}
