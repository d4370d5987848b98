//! Outbound notifications.
//!
//! Delivery is a collaborator: callers fire a [`Notification`] after a state
//! transition and carry on regardless of the result.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::types::PaymentStatus;

/// Something a user should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Notification {
    BookingConfirmation {
        slot_id: String,
        student_id: String,
    },
    BookingCancellation {
        slot_id: String,
        student_id: String,
    },
    ClassCompleted {
        session_id: String,
        student_id: String,
        payment_status: PaymentStatus,
    },
    WaitlistNotified {
        entry_id: String,
        student_id: String,
        expires_at: DateTime<Utc>,
    },
    ClassReminder {
        slot_id: String,
        lead_minutes: i64,
    },
}

impl Notification {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BookingConfirmation { .. } => "booking_confirmation",
            Self::BookingCancellation { .. } => "booking_cancellation",
            Self::ClassCompleted { .. } => "class_completed",
            Self::WaitlistNotified { .. } => "waitlist_notified",
            Self::ClassReminder { .. } => "class_reminder",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BookingConfirmation { slot_id, .. } | Self::BookingCancellation { slot_id, .. } => {
                write!(f, "{} for slot {slot_id}", self.kind())
            }
            Self::ClassCompleted { session_id, .. } => {
                write!(f, "{} for session {session_id}", self.kind())
            }
            Self::WaitlistNotified { entry_id, .. } => {
                write!(f, "{} for entry {entry_id}", self.kind())
            }
            Self::ClassReminder {
                slot_id,
                lead_minutes,
            } => write!(f, "{} for slot {slot_id} ({lead_minutes} min ahead)", self.kind()),
        }
    }
}

/// Sends notifications. Returns whether delivery was accepted.
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: &Notification) -> bool;

    fn booking_confirmation(&self, slot_id: &str, student_id: &str) -> bool {
        self.deliver(&Notification::BookingConfirmation {
            slot_id: slot_id.to_string(),
            student_id: student_id.to_string(),
        })
    }

    fn booking_cancellation(&self, slot_id: &str, student_id: &str) -> bool {
        self.deliver(&Notification::BookingCancellation {
            slot_id: slot_id.to_string(),
            student_id: student_id.to_string(),
        })
    }

    fn class_completed(&self, session_id: &str, student_id: &str, payment_status: PaymentStatus) -> bool {
        self.deliver(&Notification::ClassCompleted {
            session_id: session_id.to_string(),
            student_id: student_id.to_string(),
            payment_status,
        })
    }

    fn waitlist_notified(&self, entry_id: &str, student_id: &str, expires_at: DateTime<Utc>) -> bool {
        self.deliver(&Notification::WaitlistNotified {
            entry_id: entry_id.to_string(),
            student_id: student_id.to_string(),
            expires_at,
        })
    }

    fn class_reminder(&self, slot_id: &str, lead_minutes: i64) -> bool {
        self.deliver(&Notification::ClassReminder {
            slot_id: slot_id.to_string(),
            lead_minutes,
        })
    }
}

/// Logs a failed delivery. The triggering transition is never affected.
pub fn log_delivery(sent: bool, what: &str) {
    if !sent {
        warn!(notification = what, "notification delivery failed");
    }
}

/// Records notifications in the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: &Notification) -> bool {
        info!(kind = notification.kind(), "notify: {notification}");
        true
    }
}
