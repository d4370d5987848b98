//! Core type definitions with validation.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for core types and rules.
///
/// Every variant is raised before any mutation happens, so callers can fix the
/// input and retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A string did not name a known variant.
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// A time of day could not be parsed.
    #[error("invalid time of day: {value}")]
    InvalidTime { value: String },

    /// A range whose start is not before its end.
    #[error("start time {start} must be before end time {end}")]
    InvalidRange { start: String, end: String },

    /// A numeric argument outside its allowed bounds.
    #[error("{field} out of range: {message}")]
    OutOfRange {
        field: &'static str,
        message: String,
    },

    /// Class actions are only accepted between 06:00 and 23:00 local time.
    #[error("{time} is outside class hours (06:00-23:00)")]
    OutsideClassHours { time: NaiveTime },

    /// The enrollment has a tentative schedule and `time` is not near any slot.
    #[error("{time} is not within {tolerance_minutes} minutes of a scheduled class")]
    OutsideScheduleWindow {
        time: NaiveTime,
        tolerance_minutes: i64,
    },

    /// The meeting URL differs from the one registered on the enrollment.
    #[error("meeting URL does not match the enrollment's registered URL")]
    MeetingUrlMismatch,

    /// A transition was requested from the wrong state.
    #[error("{entity} {id} is {status}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
        expected: &'static str,
    },

    /// An operation was asked to do something it deliberately does not handle.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Generates a string-backed enum with `as_str`, `Display` and `FromStr`.
///
/// The string forms are the storage representation as well as the serde form.
macro_rules! define_str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// String representation for database storage.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::types::ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    _ => Err($crate::types::ValidationError::InvalidValue {
                        field: $field_name,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use define_str_enum;

define_str_enum!(
    /// Lifecycle state of a class session.
    SessionStatus, "session status" {
        InProgress => "in_progress",
        Completed => "completed",
    }
);

define_str_enum!(
    /// Billing outcome of a settled session.
    PaymentStatus, "payment status" {
        Paid => "paid",
        Partial => "partial",
        Unpaid => "unpaid",
    }
);

define_str_enum!(
    /// State of a bookable schedule slot.
    SlotStatus, "slot status" {
        Available => "available",
        Booked => "booked",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

define_str_enum!(
    /// State of a waitlist entry.
    WaitlistStatus, "waitlist status" {
        Waiting => "waiting",
        Notified => "notified",
        Fulfilled => "fulfilled",
        Expired => "expired",
    }
);

define_str_enum!(
    /// Kind of credit ledger entry.
    TransactionKind, "transaction type" {
        Purchase => "purchase",
        Deduction => "deduction",
        /// Credit returned when a booking is cancelled.
        Refund => "refund",
    }
);

define_str_enum!(
    /// What a ledger entry points at.
    ReferenceType, "reference type" {
        Payment => "payment",
        ClassLog => "class_log",
        SlotBooking => "slot_booking",
    }
);

/// Rejects empty or whitespace-only identifiers.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}
