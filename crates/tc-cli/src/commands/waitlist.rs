//! Waitlist queue commands.

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use tc_core::notify::log_delivery;
use tc_core::waitlist::WaitlistAction as EntryAction;
use tc_core::{Moment, Notifier, WaitlistEntry};
use tc_db::Database;
use tracing::info;

use super::util::{wait_target, write_json};
use crate::WaitlistAction;

#[derive(Serialize)]
struct Position {
    entry_id: String,
    position: usize,
}

#[derive(Serialize)]
struct Expired {
    expired: usize,
}

fn announce(notifier: &dyn Notifier, entry: &WaitlistEntry) {
    log_delivery(
        notifier.waitlist_notified(&entry.id, &entry.student_id, entry.expires_at),
        "waitlist_notified",
    );
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &WaitlistAction,
    notifier: &dyn Notifier,
    now: &Moment,
) -> Result<()> {
    match action {
        WaitlistAction::Join {
            teacher,
            student,
            target,
            priority,
        } => {
            let target = wait_target(target)?;
            let joined = db
                .join_waitlist_at(teacher, student, &target, *priority, now.utc)
                .context("failed to join waitlist")?;
            write_json(writer, &joined)
        }
        WaitlistAction::Position { entry_id } => {
            let position = db.waitlist_position(entry_id)?;
            write_json(
                writer,
                &Position {
                    entry_id: entry_id.clone(),
                    position,
                },
            )
        }
        WaitlistAction::NotifyNext { teacher, target } => {
            let target = wait_target(target)?;
            let notified = db.notify_next(teacher, &target, now.utc)?;
            match &notified {
                Some(entry) => announce(notifier, entry),
                None => info!(teacher_id = %teacher, "nobody waiting"),
            }
            write_json(writer, &notified)
        }
        WaitlistAction::Manage {
            entry_id,
            action,
            hours,
        } => {
            let action = EntryAction::parse(action, *hours)?;
            let outcome = db
                .manage_waitlist(entry_id, action, now.utc)
                .context("failed to update waitlist entry")?;
            if action == EntryAction::Notify {
                announce(notifier, &outcome.entry);
            }
            write_json(writer, &outcome)
        }
        WaitlistAction::Expire => {
            let expired = db.expire_waitlist(now.utc)?;
            info!(expired, "waitlist entries expired");
            write_json(writer, &Expired { expired })
        }
    }
}
