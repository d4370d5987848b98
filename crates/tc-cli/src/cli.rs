//! Command-line argument definitions.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tc_core::conflict::{Direction, Strategy};
use tc_core::recurrence::SeriesAction;
use tc_core::session::StartSource;
use tc_core::types::SessionStatus;

/// Tuition class management.
///
/// Tracks prepaid credit hours, class sessions and the teacher's bookable
/// schedule, and detects classes from meeting-link activity.
#[derive(Debug, Parser)]
#[command(name = "tc", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Buy credit hours or inspect an account.
    #[command(subcommand)]
    Credits(CreditsAction),

    /// Manage teacher/student enrollments.
    #[command(subcommand)]
    Enroll(EnrollAction),

    /// Start, end and settle class sessions.
    #[command(subcommand)]
    Session(SessionAction),

    /// Probe watched meeting links, start/end classes, then clean up.
    Detect,

    /// Close stale in-progress sessions.
    Cleanup,

    /// Conflict checks, slot creation and bookings.
    #[command(subcommand)]
    Slots(SlotsAction),

    /// Weekly recurring slots.
    #[command(subcommand)]
    Recurring(RecurringAction),

    /// Waitlists for full slots.
    #[command(subcommand)]
    Waitlist(WaitlistAction),

    /// Show database summary.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum CreditsAction {
    /// Add purchased hours.
    Purchase {
        #[arg(long)]
        student: String,
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        hours: f64,
        #[arg(long)]
        rate: Option<f64>,
        #[arg(long)]
        parent: Option<String>,
        /// Payment the hours were bought with.
        #[arg(long)]
        payment_ref: Option<String>,
    },
    /// Show the balance, optionally with the ledger.
    Show {
        #[arg(long)]
        student: String,
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        ledger: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum EnrollAction {
    /// Enroll a student with a teacher.
    Add {
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        student: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        meeting_url: Option<String>,
        #[arg(long, default_value_t = 1)]
        classes_per_week: u32,
        /// Tentative weekly class start, e.g. `mon@16:00`. Repeatable.
        #[arg(long = "schedule")]
        schedule: Vec<String>,
    },
    /// List active enrollments.
    List {
        #[arg(long)]
        teacher: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionAction {
    /// Start a class.
    Start {
        #[arg(long)]
        teacher: String,
        /// Student id, or the email on the enrollment.
        #[arg(long)]
        student: String,
        #[arg(long)]
        meeting_url: Option<String>,
        #[arg(long, default_value = "manual")]
        source: StartSource,
        /// Skip URL, class-hours and schedule checks.
        #[arg(long = "override")]
        manual_override: bool,
        /// Corrected start instant (RFC 3339 or "N minutes ago").
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        slot: Option<String>,
        /// Do not probe the meeting URL first.
        #[arg(long)]
        no_verify: bool,
    },
    /// End a class and settle it.
    End {
        session_id: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        topics: Option<String>,
        #[arg(long)]
        homework: Option<String>,
        #[arg(long)]
        note: Option<String>,
        /// Corrected end instant (RFC 3339 or "N minutes ago").
        #[arg(long)]
        at: Option<String>,
    },
    /// Settle a completed session (idempotent).
    Settle { session_id: String },
    /// List sessions, newest first.
    List {
        #[arg(long)]
        teacher: Option<String>,
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        status: Option<SessionStatus>,
    },
}

/// Where a slot goes: a date, or a weekday in the weekly template.
#[derive(Debug, Clone, Args)]
pub struct PlacementArgs {
    /// One-off date (YYYY-MM-DD).
    #[arg(long, conflicts_with = "day", required_unless_present = "day")]
    pub date: Option<NaiveDate>,
    /// Weekday for a weekly slot (e.g. `mon`).
    #[arg(long)]
    pub day: Option<String>,
    #[arg(long)]
    pub start: String,
    #[arg(long)]
    pub end: String,
}

#[derive(Debug, Subcommand)]
pub enum SlotsAction {
    /// Check candidates from a JSON file against the schedule.
    Check {
        #[arg(long)]
        teacher: String,
        /// JSON array of `{"target": {"date": ...} | {"weekly": ...}, "start", "end"}`.
        #[arg(long)]
        file: PathBuf,
        /// First date of the look-ahead window for weekly candidates.
        #[arg(long)]
        from: Option<NaiveDate>,
    },
    /// Resolve a conflicting candidate.
    Resolve {
        #[arg(long)]
        teacher: String,
        #[command(flatten)]
        placement: PlacementArgs,
        #[arg(long, default_value = "suggest_alternatives")]
        strategy: Strategy,
        #[arg(long, default_value = "any")]
        direction: Direction,
        #[arg(long, default_value_t = tc_core::conflict::DEFAULT_MAX_ADJUSTMENT_MINUTES)]
        max_adjustment: i64,
        #[arg(long)]
        allow_day_change: bool,
    },
    /// Create a conflict-free slot.
    Create {
        #[arg(long)]
        teacher: String,
        #[command(flatten)]
        placement: PlacementArgs,
        #[arg(long)]
        subject: Option<String>,
    },
    /// Book an available slot for a student.
    Book {
        slot_id: String,
        #[arg(long)]
        student: String,
    },
    /// Cancel a booking and offer the time to the waitlist.
    Cancel { slot_id: String },
    /// Mark a booked slot as taught.
    Complete { slot_id: String },
    /// Block time on a date or weekday.
    Block {
        #[arg(long)]
        teacher: String,
        #[command(flatten)]
        placement: PlacementArgs,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Send reminders for booked slots starting soon.
    Remind {
        #[arg(long)]
        teacher: String,
    },
    /// List the schedule: dated slots, weekly templates and blocks.
    List {
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        from: Option<NaiveDate>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RecurringAction {
    /// Expand weekly definitions from a JSON request file.
    Create {
        #[arg(long)]
        file: PathBuf,
        /// Report expansion and conflicts without writing.
        #[arg(long)]
        preview: bool,
    },
    /// Update or delete a recurring series.
    Modify {
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        template: String,
        #[arg(long)]
        action: SeriesAction,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        /// Also move booked slots.
        #[arg(long)]
        include_booked: bool,
        /// First date affected; defaults to today.
        #[arg(long)]
        from: Option<NaiveDate>,
    },
}

/// What a waitlist entry waits for: a slot id, or a weekday window.
#[derive(Debug, Clone, Args)]
pub struct WaitTargetArgs {
    #[arg(long, conflicts_with_all = ["day", "start", "end"], required_unless_present = "day")]
    pub slot: Option<String>,
    #[arg(long, requires_all = ["start", "end"])]
    pub day: Option<String>,
    #[arg(long)]
    pub start: Option<String>,
    #[arg(long)]
    pub end: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WaitlistAction {
    /// Join the queue for a full slot or window.
    Join {
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        student: String,
        #[command(flatten)]
        target: WaitTargetArgs,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show an entry's place in its queue.
    Position { entry_id: String },
    /// Offer the target to the head of its queue.
    NotifyNext {
        #[arg(long)]
        teacher: String,
        #[command(flatten)]
        target: WaitTargetArgs,
    },
    /// notify, fulfill, remove, or extend an entry.
    Manage {
        entry_id: String,
        #[arg(long)]
        action: String,
        /// Hours for `extend` (1-168).
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Expire overdue entries.
    Expire,
}
