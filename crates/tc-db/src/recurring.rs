//! Recurring slot creation and series edits.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tc_core::conflict::{DateWindow, SlotConflicts};
use tc_core::recurrence::{
    Expansion, RecurringSlotDef, SeriesAction, SeriesUpdate, apply_update, belongs_to_series,
    editable, expand, validate_weeks,
};
use tc_core::slot::{CandidateSlot, ScheduleSlot, SlotTarget, TimeSlotTemplate};
use tc_core::time_range::format_time;
use tc_core::types::{SlotStatus, ValidationError, require_non_empty};
use tracing::{info, warn};

use crate::slots::{
    NewSlot, NewTemplate, TeacherSchedule, insert_slot, insert_template, load_template,
    query_slots,
};
use crate::{Database, DbError, format_date};

const fn default_weeks() -> u32 {
    4
}

const fn yes() -> bool {
    true
}

/// Weekly definitions to expand into templates and dated slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRequest {
    pub teacher_id: String,
    pub slots: Vec<RecurringSlotDef>,
    #[serde(default = "default_weeks")]
    pub weeks: u32,
    /// First date considered; defaults to today.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub exceptions: Vec<NaiveDate>,
    #[serde(default = "yes")]
    pub create_template: bool,
    #[serde(default = "yes")]
    pub create_slots: bool,
    #[serde(default)]
    pub preview_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecurringOutcome {
    pub expansions: Vec<Expansion>,
    pub conflicts: Vec<SlotConflicts>,
    pub templates: Vec<TimeSlotTemplate>,
    pub slots: Vec<ScheduleSlot>,
    /// Items that could not be written; the rest were.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesOutcome {
    /// The template after the edit, or as it was before deletion.
    pub template: TimeSlotTemplate,
    pub updated: usize,
    pub deleted: usize,
    /// Booked slots left untouched.
    pub skipped_booked: usize,
}

fn validate_defs(defs: &[RecurringSlotDef]) -> Result<(), ValidationError> {
    if defs.is_empty() {
        return Err(ValidationError::Empty { field: "slots" });
    }
    for def in defs {
        if def.time.start >= def.time.end {
            return Err(ValidationError::InvalidRange {
                start: format_time(def.time.start),
                end: format_time(def.time.end),
            });
        }
    }
    Ok(())
}

impl Database {
    /// Expands weekly definitions and writes them, or previews the result.
    ///
    /// Every generated date is conflict-checked first. Outside preview mode
    /// any conflict aborts with [`DbError::SlotConflicts`] before anything is
    /// written; otherwise write failures are collected per item.
    pub fn create_recurring(
        &mut self,
        request: &RecurringRequest,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RecurringOutcome, DbError> {
        require_non_empty("teacher id", &request.teacher_id)?;
        validate_defs(&request.slots)?;
        let weeks = validate_weeks(request.weeks)?;
        let start = request.start_date.unwrap_or(today);
        let expansions = expand(&request.slots, weeks, start, &request.exceptions)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut schedule = TeacherSchedule::load(&tx, &request.teacher_id)?;
        let window = DateWindow::lookahead(start);
        let conflicts: Vec<SlotConflicts> = expansions
            .iter()
            .flat_map(|expansion| {
                expansion.dates.iter().map(|date| CandidateSlot {
                    target: SlotTarget::Date(*date),
                    time: expansion.slot.time,
                })
            })
            .map(|candidate| schedule.conflicts(&candidate, window))
            .filter(|conflicts| !conflicts.is_empty())
            .collect();

        if request.preview_only {
            return Ok(RecurringOutcome {
                expansions,
                conflicts,
                ..RecurringOutcome::default()
            });
        }
        if !conflicts.is_empty() {
            return Err(DbError::SlotConflicts(conflicts));
        }

        let mut outcome = RecurringOutcome {
            expansions,
            ..RecurringOutcome::default()
        };
        for expansion in &outcome.expansions {
            let def = &expansion.slot;
            let template = if request.create_template {
                let written = insert_template(
                    &tx,
                    &NewTemplate {
                        teacher_id: &request.teacher_id,
                        day_of_week: def.day_of_week,
                        time: def.time,
                        subject: def.subject.as_deref(),
                        recurrence_end_date: def.recurrence_end_date,
                    },
                    now,
                );
                match written {
                    Ok(template) => Some(template),
                    Err(err) => {
                        warn!(day = %def.day_of_week, error = %err, "template not created");
                        outcome
                            .errors
                            .push(format!("template {} {}: {err}", def.day_of_week, def.time));
                        None
                    }
                }
            } else {
                None
            };

            if request.create_slots {
                for date in &expansion.dates {
                    let candidate = CandidateSlot {
                        target: SlotTarget::Date(*date),
                        time: def.time,
                    };
                    // Earlier definitions in this request may now collide.
                    if !schedule.conflicts(&candidate, window).is_empty() {
                        outcome
                            .errors
                            .push(format!("slot {} {}: conflicts", format_date(*date), def.time));
                        continue;
                    }
                    let written = insert_slot(
                        &tx,
                        &NewSlot {
                            teacher_id: &request.teacher_id,
                            date: *date,
                            time: def.time,
                            subject: def.subject.as_deref(),
                            template_id: template.as_ref().map(|t| t.id.as_str()),
                            recurring: true,
                            is_override: false,
                        },
                        now,
                    );
                    match written {
                        Ok(slot) => {
                            schedule.slots.push(slot.clone());
                            outcome.slots.push(slot);
                        }
                        Err(err) => {
                            warn!(date = %date, error = %err, "slot not created");
                            outcome
                                .errors
                                .push(format!("slot {} {}: {err}", format_date(*date), def.time));
                        }
                    }
                }
            }

            if let Some(template) = template {
                schedule.templates.push(template.clone());
                outcome.templates.push(template);
            }
        }
        tx.commit()?;

        info!(
            teacher_id = %request.teacher_id,
            templates = outcome.templates.len(),
            slots = outcome.slots.len(),
            errors = outcome.errors.len(),
            "recurring schedule created"
        );
        Ok(outcome)
    }

    /// Updates or deletes a template and its future materialized slots.
    ///
    /// Slots are matched on the template's weekday and time as they were
    /// before the edit, from `apply_from` onward. Booked slots move only for
    /// `update_series` with `include_booked`; completed and cancelled slots
    /// are never touched.
    pub fn modify_series(
        &mut self,
        teacher_id: &str,
        template_id: &str,
        action: SeriesAction,
        update: &SeriesUpdate,
        apply_from: NaiveDate,
    ) -> Result<SeriesOutcome, DbError> {
        let action = action.require_series()?;
        if let Some(time) = update.time {
            if time.start >= time.end {
                return Err(ValidationError::InvalidRange {
                    start: format_time(time.start),
                    end: format_time(time.end),
                }
                .into());
            }
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let template = load_template(&tx, template_id)?
            .filter(|template| template.teacher_id == teacher_id)
            .ok_or_else(|| DbError::not_found("template", template_id))?;
        let series: Vec<ScheduleSlot> = query_slots(
            &tx,
            "WHERE teacher_id = ? AND date >= ?",
            params![teacher_id, format_date(apply_from)],
        )?
        .into_iter()
        .filter(|slot| belongs_to_series(slot, &template, apply_from))
        .collect();

        let mut outcome = SeriesOutcome {
            template: template.clone(),
            updated: 0,
            deleted: 0,
            skipped_booked: 0,
        };
        if action == SeriesAction::UpdateSeries {
            let updated = apply_update(&template, update);
            tx.execute(
                "
                UPDATE time_slot_templates
                SET start_time = ?, end_time = ?, duration_minutes = ?, subject = ?
                WHERE id = ?
                ",
                params![
                    format_time(updated.time.start),
                    format_time(updated.time.end),
                    updated.duration_minutes,
                    updated.subject,
                    template_id,
                ],
            )?;
            for slot in &series {
                if !editable(slot, action, update.include_booked) {
                    if slot.status == SlotStatus::Booked {
                        outcome.skipped_booked += 1;
                    }
                    continue;
                }
                tx.execute(
                    "
                    UPDATE schedule_slots
                    SET start_time = ?, end_time = ?, duration_minutes = ?, subject = ?
                    WHERE id = ?
                    ",
                    params![
                        format_time(updated.time.start),
                        format_time(updated.time.end),
                        updated.duration_minutes,
                        updated.subject,
                        slot.id,
                    ],
                )?;
                outcome.updated += 1;
            }
            outcome.template = updated;
        } else {
            tx.execute("DELETE FROM time_slot_templates WHERE id = ?", [template_id])?;
            for slot in &series {
                if !editable(slot, action, update.include_booked) {
                    if slot.status == SlotStatus::Booked {
                        outcome.skipped_booked += 1;
                    }
                    continue;
                }
                tx.execute(
                    "DELETE FROM schedule_slots WHERE id = ? AND status = 'available'",
                    [&slot.id],
                )?;
                outcome.deleted += 1;
            }
        }
        tx.commit()?;

        info!(
            template_id,
            action = %action,
            updated = outcome.updated,
            deleted = outcome.deleted,
            skipped_booked = outcome.skipped_booked,
            "series modified"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreditPurchase;
    use chrono::{Duration, TimeZone, Weekday};
    use tc_core::time_range::TimeRange;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn mondays_at_ten(weeks: u32) -> RecurringRequest {
        RecurringRequest {
            teacher_id: "t-1".to_string(),
            slots: vec![RecurringSlotDef {
                day_of_week: Weekday::Mon,
                time: TimeRange::parse("10:00", "11:00").unwrap(),
                subject: Some("Maths".to_string()),
                recurrence_end_date: None,
            }],
            weeks,
            start_date: Some(monday()),
            exceptions: Vec::new(),
            create_template: true,
            create_slots: true,
            preview_only: false,
        }
    }

    #[test]
    fn four_mondays_become_template_and_slots() {
        let mut db = Database::open_in_memory().unwrap();
        let outcome = db.create_recurring(&mondays_at_ten(4), monday(), now()).unwrap();

        assert_eq!(outcome.templates.len(), 1);
        assert_eq!(outcome.slots.len(), 4);
        assert!(outcome.errors.is_empty());
        let template_id = outcome.templates[0].id.clone();
        for (week, slot) in outcome.slots.iter().enumerate() {
            assert_eq!(slot.date, monday() + Duration::weeks(week as i64));
            assert!(slot.is_recurring);
            assert_eq!(slot.template_id.as_deref(), Some(template_id.as_str()));
        }
    }

    #[test]
    fn preview_writes_nothing_and_reports_conflicts() {
        let mut db = Database::open_in_memory().unwrap();
        db.create_recurring(&mondays_at_ten(2), monday(), now()).unwrap();

        let preview = RecurringRequest {
            preview_only: true,
            ..mondays_at_ten(4)
        };
        let outcome = db.create_recurring(&preview, monday(), now()).unwrap();
        assert_eq!(outcome.expansions[0].dates.len(), 4);
        // Every date hits the template; the first two also hit dated slots.
        assert_eq!(outcome.conflicts.len(), 4);
        assert!(outcome.slots.is_empty());
        assert_eq!(db.list_templates("t-1").unwrap().len(), 1);

        let err = db
            .create_recurring(&mondays_at_ten(4), monday(), now())
            .unwrap_err();
        assert!(matches!(err, DbError::SlotConflicts(list) if list.len() == 4));
    }

    #[test]
    fn exceptions_and_end_date_bound_the_expansion() {
        let mut db = Database::open_in_memory().unwrap();
        let mut request = mondays_at_ten(6);
        request.exceptions = vec![monday() + Duration::weeks(1)];
        request.slots[0].recurrence_end_date = Some(monday() + Duration::weeks(3));
        let outcome = db.create_recurring(&request, monday(), now()).unwrap();
        assert_eq!(outcome.slots.len(), 3);
    }

    #[test]
    fn weeks_are_bounded() {
        let mut db = Database::open_in_memory().unwrap();
        for weeks in [0, 53] {
            assert!(matches!(
                db.create_recurring(&mondays_at_ten(weeks), monday(), now()),
                Err(DbError::Validation(_))
            ));
        }
    }

    #[test]
    fn update_series_moves_available_slots_only() {
        let mut db = Database::open_in_memory().unwrap();
        let created = db.create_recurring(&mondays_at_ten(4), monday(), now()).unwrap();
        let template_id = created.templates[0].id.clone();
        db.purchase_credits_at(
            &CreditPurchase {
                student_id: "s-1".to_string(),
                teacher_id: "t-1".to_string(),
                parent_id: None,
                hours: 2.0,
                rate_per_hour: None,
                payment_reference: None,
            },
            now(),
        )
        .unwrap();
        db.book_slot(&created.slots[1].id, "s-1", now()).unwrap();

        let update = SeriesUpdate {
            time: Some(TimeRange::parse("14:00", "15:00").unwrap()),
            subject: None,
            include_booked: false,
        };
        let outcome = db
            .modify_series("t-1", &template_id, SeriesAction::UpdateSeries, &update, monday())
            .unwrap();
        assert_eq!(outcome.updated, 3);
        assert_eq!(outcome.skipped_booked, 1);
        assert_eq!(outcome.template.time, update.time.unwrap());

        let booked = db.slot(&created.slots[1].id).unwrap().unwrap();
        assert_eq!(booked.time, TimeRange::parse("10:00", "11:00").unwrap());
        let moved = db.slot(&created.slots[2].id).unwrap().unwrap();
        assert_eq!(moved.time, update.time.unwrap());
    }

    #[test]
    fn delete_series_respects_apply_from() {
        let mut db = Database::open_in_memory().unwrap();
        let created = db.create_recurring(&mondays_at_ten(4), monday(), now()).unwrap();
        let template_id = created.templates[0].id.clone();

        let outcome = db
            .modify_series(
                "t-1",
                &template_id,
                SeriesAction::DeleteSeries,
                &SeriesUpdate::default(),
                monday() + Duration::weeks(2),
            )
            .unwrap();
        assert_eq!(outcome.deleted, 2);
        assert!(db.list_templates("t-1").unwrap().is_empty());
        assert!(db.slot(&created.slots[0].id).unwrap().is_some());
        assert!(db.slot(&created.slots[3].id).unwrap().is_none());
    }

    #[test]
    fn series_edits_check_action_and_owner() {
        let mut db = Database::open_in_memory().unwrap();
        let created = db.create_recurring(&mondays_at_ten(1), monday(), now()).unwrap();
        let template_id = created.templates[0].id.clone();

        assert!(matches!(
            db.modify_series(
                "t-1",
                &template_id,
                SeriesAction::UpdateInstance,
                &SeriesUpdate::default(),
                monday()
            ),
            Err(DbError::Validation(ValidationError::Unsupported(_)))
        ));
        assert!(matches!(
            db.modify_series(
                "t-2",
                &template_id,
                SeriesAction::DeleteSeries,
                &SeriesUpdate::default(),
                monday()
            ),
            Err(DbError::NotFound { .. })
        ));
    }
}
