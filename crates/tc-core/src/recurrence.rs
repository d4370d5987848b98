//! Weekly recurrence expansion and series edits.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::slot::{ScheduleSlot, TimeSlotTemplate};
use crate::time_range::TimeRange;
use crate::types::{SlotStatus, ValidationError, define_str_enum};

pub const MAX_WEEKS: u32 = 52;

/// Rejects expansions outside `1..=52` weeks.
pub fn validate_weeks(weeks: u32) -> Result<u32, ValidationError> {
    if weeks == 0 || weeks > MAX_WEEKS {
        return Err(ValidationError::OutOfRange {
            field: "weeks",
            message: format!("expected 1..={MAX_WEEKS}, got {weeks}"),
        });
    }
    Ok(weeks)
}

/// First `day` on or after `from`.
pub fn first_occurrence(day: Weekday, from: NaiveDate) -> NaiveDate {
    let ahead = (7 + i64::from(day.num_days_from_monday())
        - i64::from(from.weekday().num_days_from_monday()))
        % 7;
    from + Duration::days(ahead)
}

/// One date per week for `weeks` weeks, starting at the first `day` on or
/// after `start`. Dates listed in `exceptions` are skipped but still count
/// toward `weeks`.
pub fn generate_dates(
    day: Weekday,
    start: NaiveDate,
    weeks: u32,
    exceptions: &[NaiveDate],
) -> Result<Vec<NaiveDate>, ValidationError> {
    validate_weeks(weeks)?;
    let first = first_occurrence(day, start);
    Ok((0..i64::from(weeks))
        .map(|week| first + Duration::weeks(week))
        .filter(|date| !exceptions.contains(date))
        .collect())
}

/// One weekly slot definition in a recurring request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSlotDef {
    pub day_of_week: Weekday,
    #[serde(flatten)]
    pub time: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Last date the series may produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_end_date: Option<NaiveDate>,
}

/// A definition and the dates it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub slot: RecurringSlotDef,
    pub dates: Vec<NaiveDate>,
}

/// Expands every definition, honouring each one's `recurrence_end_date`.
pub fn expand(
    defs: &[RecurringSlotDef],
    weeks: u32,
    start: NaiveDate,
    exceptions: &[NaiveDate],
) -> Result<Vec<Expansion>, ValidationError> {
    defs.iter()
        .map(|def| {
            let mut dates = generate_dates(def.day_of_week, start, weeks, exceptions)?;
            if let Some(end) = def.recurrence_end_date {
                dates.retain(|date| *date <= end);
            }
            Ok(Expansion {
                slot: def.clone(),
                dates,
            })
        })
        .collect()
}

define_str_enum!(
    /// What `modify_series` should do.
    SeriesAction, "series action" {
        UpdateSeries => "update_series",
        DeleteSeries => "delete_series",
        UpdateInstance => "update_instance",
        DeleteInstance => "delete_instance",
    }
);

impl SeriesAction {
    /// Instance edits belong to the per-slot commands.
    pub fn require_series(self) -> Result<Self, ValidationError> {
        match self {
            Self::UpdateSeries | Self::DeleteSeries => Ok(self),
            Self::UpdateInstance | Self::DeleteInstance => Err(ValidationError::Unsupported(
                format!("{self} is not a series action; edit the slot directly"),
            )),
        }
    }
}

/// Changes applied by `update_series`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesUpdate {
    #[serde(default)]
    pub time: Option<TimeRange>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Also move booked slots.
    #[serde(default)]
    pub include_booked: bool,
}

/// The template after `update` is applied.
pub fn apply_update(template: &TimeSlotTemplate, update: &SeriesUpdate) -> TimeSlotTemplate {
    let mut updated = template.clone();
    if let Some(time) = update.time {
        updated.time = time;
        updated.duration_minutes = time.minutes();
    }
    if let Some(subject) = &update.subject {
        updated.subject = Some(subject.clone());
    }
    updated
}

/// Whether `slot` was materialized from `template` (matched on the template's
/// current weekday and time signature) and falls on or after `from`.
pub fn belongs_to_series(slot: &ScheduleSlot, template: &TimeSlotTemplate, from: NaiveDate) -> bool {
    slot.is_recurring
        && slot.teacher_id == template.teacher_id
        && slot.date >= from
        && slot.weekday() == template.day_of_week
        && slot.time == template.time
}

/// Whether a series edit may touch `slot`.
pub fn editable(slot: &ScheduleSlot, action: SeriesAction, include_booked: bool) -> bool {
    match slot.status {
        SlotStatus::Available => true,
        SlotStatus::Booked => action == SeriesAction::UpdateSeries && include_booked,
        SlotStatus::Completed | SlotStatus::Cancelled => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn four_mondays_from_a_monday() {
        let dates = generate_dates(Weekday::Mon, date(2024, 1, 1), 4, &[]).unwrap();
        assert_eq!(dates.len(), 4);
        assert_eq!(dates[0], date(2024, 1, 1));
        for pair in dates.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::days(7));
        }
    }

    #[test]
    fn expansion_starts_at_next_matching_weekday() {
        let dates = generate_dates(Weekday::Fri, date(2024, 1, 1), 2, &[]).unwrap();
        assert_eq!(dates, vec![date(2024, 1, 5), date(2024, 1, 12)]);
        assert_eq!(first_occurrence(Weekday::Sun, date(2024, 1, 7)), date(2024, 1, 7));
    }

    #[test]
    fn exceptions_are_skipped() {
        let dates = generate_dates(Weekday::Mon, date(2024, 1, 1), 3, &[date(2024, 1, 8)]).unwrap();
        assert_eq!(dates, vec![date(2024, 1, 1), date(2024, 1, 15)]);
    }

    #[test]
    fn weeks_must_be_in_range() {
        assert!(generate_dates(Weekday::Mon, date(2024, 1, 1), 0, &[]).is_err());
        assert!(generate_dates(Weekday::Mon, date(2024, 1, 1), 53, &[]).is_err());
        assert_eq!(generate_dates(Weekday::Mon, date(2024, 1, 1), 52, &[]).unwrap().len(), 52);
    }

    #[test]
    fn end_date_bounds_expansion() {
        let def = RecurringSlotDef {
            day_of_week: Weekday::Mon,
            time: TimeRange::parse("10:00", "11:00").unwrap(),
            subject: None,
            recurrence_end_date: Some(date(2024, 1, 15)),
        };
        let expansions = expand(&[def], 8, date(2024, 1, 1), &[]).unwrap();
        assert_eq!(expansions[0].dates.len(), 3);
    }

    #[test]
    fn instance_actions_are_rejected() {
        assert!(SeriesAction::UpdateSeries.require_series().is_ok());
        assert!(matches!(
            SeriesAction::DeleteInstance.require_series(),
            Err(ValidationError::Unsupported(_))
        ));
    }

    #[test]
    fn series_membership_and_editability() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let time = TimeRange::parse("10:00", "11:00").unwrap();
        let template = TimeSlotTemplate {
            id: "tpl".to_string(),
            teacher_id: "t-1".to_string(),
            day_of_week: Weekday::Mon,
            time,
            subject: None,
            duration_minutes: 60,
            is_available: true,
            is_recurring: true,
            recurrence_end_date: None,
            created_at: created,
        };
        let mut slot = ScheduleSlot {
            id: "s".to_string(),
            teacher_id: "t-1".to_string(),
            date: date(2024, 1, 8),
            time,
            duration_minutes: 60,
            status: SlotStatus::Booked,
            student_id: Some("st".to_string()),
            subject: None,
            is_recurring: true,
            template_id: Some("tpl".to_string()),
            is_override: false,
            created_at: created,
        };
        assert!(belongs_to_series(&slot, &template, date(2024, 1, 2)));
        assert!(!belongs_to_series(&slot, &template, date(2024, 1, 9)));
        assert!(!editable(&slot, SeriesAction::UpdateSeries, false));
        assert!(editable(&slot, SeriesAction::UpdateSeries, true));
        assert!(!editable(&slot, SeriesAction::DeleteSeries, true));
        slot.status = SlotStatus::Available;
        assert!(editable(&slot, SeriesAction::DeleteSeries, false));

        let updated = apply_update(
            &template,
            &SeriesUpdate {
                time: Some(TimeRange::parse("11:00", "12:30").unwrap()),
                subject: Some("Maths".to_string()),
                include_booked: false,
            },
        );
        assert_eq!(updated.duration_minutes, 90);
        assert_eq!(updated.subject.as_deref(), Some("Maths"));
    }
}
