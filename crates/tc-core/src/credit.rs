//! Prepaid credit hours and the settlement arithmetic.
//!
//! The functions here are pure: they decide how many hours a completed class
//! costs and what the account looks like afterwards. Applying the result
//! atomically is the storage layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PaymentStatus, ReferenceType, TransactionKind, ValidationError};

/// Tolerance for comparing hour amounts.
///
/// A deduction within this distance of the required hours counts as full
/// payment.
pub const HOURS_EPSILON: f64 = 1e-6;

/// Prepaid balance for one (student, teacher) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub id: String,
    pub student_id: String,
    pub teacher_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Never negative.
    pub balance_hours: f64,
    pub total_purchased: f64,
    pub total_used: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_hour: Option<f64>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub account_id: String,
    pub kind: TransactionKind,
    pub hours_amount: f64,
    /// Account balance immediately after this entry was applied.
    pub balance_after: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<ReferenceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What settling one session against one balance amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SettlementPlan {
    pub required_hours: f64,
    /// Part of the slot booking's hold that pays for this class.
    pub held_hours: f64,
    /// Part of the hold the class did not use, returned to the balance.
    pub released_hours: f64,
    pub deductible_hours: f64,
    /// Balance after the deduction, or `None` when there is no account.
    pub balance_after: Option<f64>,
    pub payment_status: PaymentStatus,
}

impl SettlementPlan {
    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }
}

/// Result reported for a settlement request.
///
/// `already_processed` marks an idempotent replay: the stored outcome is
/// returned and nothing was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub success: bool,
    pub credits_deducted: f64,
    pub payment_status: PaymentStatus,
    pub is_paid: bool,
    pub already_processed: bool,
}

impl SettlementOutcome {
    pub fn from_plan(plan: &SettlementPlan) -> Self {
        Self {
            success: true,
            credits_deducted: plan.held_hours + plan.deductible_hours,
            payment_status: plan.payment_status,
            is_paid: plan.is_paid(),
            already_processed: false,
        }
    }

    /// Rebuilds the outcome from fields stored on a settled session.
    pub fn replay(credits_deducted: f64, payment_status: PaymentStatus) -> Self {
        Self {
            success: true,
            credits_deducted,
            payment_status,
            is_paid: payment_status == PaymentStatus::Paid,
            already_processed: true,
        }
    }
}

/// Hours owed for a class of `duration_minutes`.
pub fn required_hours(duration_minutes: i64) -> f64 {
    duration_minutes.max(0) as f64 / 60.0
}

/// Classifies a deduction against the hours it should have covered.
pub fn payment_status(deductible: f64, required: f64) -> PaymentStatus {
    if deductible + HOURS_EPSILON >= required {
        PaymentStatus::Paid
    } else if deductible <= HOURS_EPSILON {
        PaymentStatus::Unpaid
    } else {
        PaymentStatus::Partial
    }
}

/// Plans the settlement of a class against an optional balance.
///
/// The deduction is clamped to the available balance, so the balance never
/// goes negative.
pub fn plan_settlement(balance_hours: Option<f64>, duration_minutes: i64) -> SettlementPlan {
    plan_held_settlement(balance_hours, duration_minutes, 0.0)
}

/// Plans the settlement of a class held on a booked slot.
///
/// `held_hours` were already debited when the slot was booked. They count
/// toward the class first; only the remainder comes out of the balance, and
/// any unused part of the hold is released back to it.
pub fn plan_held_settlement(
    balance_hours: Option<f64>,
    duration_minutes: i64,
    held_hours: f64,
) -> SettlementPlan {
    let required = required_hours(duration_minutes);
    let held = held_hours.max(0.0).min(required);
    let released = (held_hours.max(0.0) - held).max(0.0);
    let remaining = required - held;
    let Some(balance) = balance_hours else {
        return SettlementPlan {
            required_hours: required,
            held_hours: held,
            released_hours: released,
            deductible_hours: 0.0,
            balance_after: None,
            payment_status: payment_status(held, required),
        };
    };
    let available = balance.max(0.0) + released;
    let deductible = available.min(remaining.max(0.0));
    let balance_after = (available - deductible).max(0.0);
    SettlementPlan {
        required_hours: required,
        held_hours: held,
        released_hours: released,
        deductible_hours: deductible,
        balance_after: Some(balance_after),
        payment_status: payment_status(held + deductible, required),
    }
}

/// Validates an hour amount for purchases and refunds.
pub fn validate_hours(hours: f64) -> Result<f64, ValidationError> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "hours",
            message: format!("expected a positive number of hours, got {hours}"),
        });
    }
    Ok(hours)
}
