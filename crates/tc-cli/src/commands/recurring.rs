//! Weekly recurring slots.

use std::io::Write;

use anyhow::{Context, Result};
use tc_core::recurrence::SeriesUpdate;
use tc_core::{Moment, TimeRange};
use tc_db::{Database, DbError, RecurringRequest};

use super::util::{read_json, report_conflicts, write_json};
use crate::RecurringAction;

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &RecurringAction,
    now: &Moment,
) -> Result<()> {
    match action {
        RecurringAction::Create { file, preview } => {
            let mut request: RecurringRequest = read_json(file)?;
            request.preview_only |= *preview;
            match db.create_recurring(&request, now.local_date(), now.utc) {
                Ok(outcome) => write_json(writer, &outcome),
                Err(DbError::SlotConflicts(conflicts)) => report_conflicts(writer, &conflicts),
                Err(err) => Err(err).context("failed to create recurring slots"),
            }
        }
        RecurringAction::Modify {
            teacher,
            template,
            action,
            start,
            end,
            subject,
            include_booked,
            from,
        } => {
            let time = match (start, end) {
                (Some(start), Some(end)) => Some(TimeRange::parse(start, end)?),
                (None, None) => None,
                _ => anyhow::bail!("--start and --end must be given together"),
            };
            let update = SeriesUpdate {
                time,
                subject: subject.clone(),
                include_booked: *include_booked,
            };
            let outcome = db
                .modify_series(
                    teacher,
                    template,
                    *action,
                    &update,
                    from.unwrap_or_else(|| now.local_date()),
                )
                .context("failed to modify series")?;
            write_json(writer, &outcome)
        }
    }
}
