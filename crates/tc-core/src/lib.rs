//! Core domain logic for tuition class management.
//!
//! This crate contains the pure rules behind:
//! - Settlement: charging a completed class against prepaid credit hours
//! - Session lifecycle: start validation, end times, stale-session cleanup
//! - Auto-detection: deciding starts and ends from meeting reachability
//! - Scheduling: slot conflicts, alternative suggestions, weekly recurrence
//! - Waitlists: queue ordering and promotion
//!
//! Nothing here touches storage or the network.

pub mod conflict;
pub mod credit;
pub mod detection;
pub mod enrollment;
pub mod notify;
pub mod recurrence;
pub mod session;
pub mod slot;
pub mod time_range;
pub mod types;
pub mod waitlist;

pub use credit::{CreditAccount, CreditTransaction, SettlementOutcome, SettlementPlan};
pub use detection::{Confidence, Decision, DetectionStats, MeetingStatus, SkipReason};
pub use enrollment::{Enrollment, ScheduleEntry};
pub use notify::{LogNotifier, Notification, Notifier};
pub use session::{ClassSession, EndDetails, StartSource};
pub use slot::{BlockedSlot, CandidateSlot, ScheduleSlot, SlotTarget, TimeSlotTemplate};
pub use time_range::{Moment, TimeRange};
pub use types::{
    PaymentStatus, ReferenceType, SessionStatus, SlotStatus, TransactionKind, ValidationError,
    WaitlistStatus,
};
pub use waitlist::{WaitlistEntry, WaitlistTarget};
