//! Credit ledger and settlement.
//!
//! Every balance change and its ledger row are written in the same
//! transaction, and each ledger row records the balance it produced.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tc_core::credit::{
    CreditAccount, CreditTransaction, HOURS_EPSILON, SettlementOutcome, plan_held_settlement,
    validate_hours,
};
use tc_core::types::{
    PaymentStatus, ReferenceType, SessionStatus, TransactionKind, ValidationError,
    require_non_empty,
};
use tracing::{debug, info};

use crate::slots::booking_debit;
use crate::{Database, DbError, format_timestamp, new_id, parse_enum, parse_timestamp};

/// Hours bought for a (student, teacher) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPurchase {
    pub student_id: String,
    pub teacher_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub hours: f64,
    #[serde(default)]
    pub rate_per_hour: Option<f64>,
    /// Payment the hours were bought with.
    #[serde(default)]
    pub payment_reference: Option<String>,
}

const ACCOUNT_COLUMNS: &str = "id, student_id, teacher_id, parent_id, balance_hours, total_purchased, total_used, rate_per_hour, is_active, updated_at";

struct AccountRow {
    account: CreditAccount,
    updated_at: String,
}

fn read_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        account: CreditAccount {
            id: row.get(0)?,
            student_id: row.get(1)?,
            teacher_id: row.get(2)?,
            parent_id: row.get(3)?,
            balance_hours: row.get(4)?,
            total_purchased: row.get(5)?,
            total_used: row.get(6)?,
            rate_per_hour: row.get(7)?,
            is_active: row.get(8)?,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        },
        updated_at: row.get(9)?,
    })
}

fn find_account(
    conn: &Connection,
    student_id: &str,
    teacher_id: &str,
) -> Result<Option<CreditAccount>, DbError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE student_id = ? AND teacher_id = ?"
            ),
            params![student_id, teacher_id],
            read_account,
        )
        .optional()?;
    row.map(|AccountRow { mut account, updated_at }| {
        account.updated_at = parse_timestamp(&updated_at, &account.id)?;
        Ok(account)
    })
    .transpose()
}

/// Account row for the pair, created with a zero balance when missing.
fn ensure_account(
    tx: &Transaction<'_>,
    purchase: &CreditPurchase,
    now: DateTime<Utc>,
) -> Result<String, DbError> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM credit_accounts WHERE student_id = ? AND teacher_id = ?",
            params![purchase.student_id, purchase.teacher_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = new_id();
    tx.execute(
        "
        INSERT INTO credit_accounts
            (id, student_id, teacher_id, parent_id, balance_hours, total_purchased, total_used, rate_per_hour, is_active, updated_at)
        VALUES (?, ?, ?, ?, 0, 0, 0, ?, 1, ?)
        ",
        params![
            id,
            purchase.student_id,
            purchase.teacher_id,
            purchase.parent_id,
            purchase.rate_per_hour,
            format_timestamp(now),
        ],
    )?;
    debug!(account_id = %id, "credit account created");
    Ok(id)
}

/// Ledger row to append.
pub(crate) struct LedgerEntry<'a> {
    pub account_id: &'a str,
    pub kind: TransactionKind,
    pub hours: f64,
    pub balance_after: f64,
    pub reference_type: Option<ReferenceType>,
    pub reference_id: Option<&'a str>,
    pub description: Option<String>,
}

pub(crate) fn append_transaction(
    conn: &Connection,
    entry: LedgerEntry<'_>,
    now: DateTime<Utc>,
) -> Result<CreditTransaction, DbError> {
    let id = new_id();
    conn.execute(
        "
        INSERT INTO credit_transactions
            (id, account_id, type, hours_amount, balance_after, reference_type, reference_id, description, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            id,
            entry.account_id,
            entry.kind.as_str(),
            entry.hours,
            entry.balance_after,
            entry.reference_type.map(|r| r.as_str()),
            entry.reference_id,
            entry.description,
            format_timestamp(now),
        ],
    )?;
    Ok(CreditTransaction {
        id,
        account_id: entry.account_id.to_string(),
        kind: entry.kind,
        hours_amount: entry.hours,
        balance_after: entry.balance_after,
        reference_type: entry.reference_type,
        reference_id: entry.reference_id.map(str::to_string),
        description: entry.description,
        created_at: now,
    })
}

/// Applies `hours` of `kind` to the account and returns the new balance.
/// `total_used` tracks deductions net of refunds.
pub(crate) fn adjust_balance(
    conn: &Connection,
    account_id: &str,
    kind: TransactionKind,
    hours: f64,
    now: DateTime<Utc>,
) -> Result<f64, DbError> {
    let sql = match kind {
        TransactionKind::Purchase => {
            "UPDATE credit_accounts
             SET balance_hours = balance_hours + ?1, total_purchased = total_purchased + ?1, updated_at = ?2
             WHERE id = ?3"
        }
        TransactionKind::Deduction => {
            "UPDATE credit_accounts
             SET balance_hours = max(balance_hours - ?1, 0), total_used = total_used + ?1, updated_at = ?2
             WHERE id = ?3"
        }
        TransactionKind::Refund => {
            "UPDATE credit_accounts
             SET balance_hours = balance_hours + ?1, total_used = max(total_used - ?1, 0), updated_at = ?2
             WHERE id = ?3"
        }
    };
    conn.execute(sql, params![hours, format_timestamp(now), account_id])?;
    let balance = conn.query_row(
        "SELECT balance_hours FROM credit_accounts WHERE id = ?",
        [account_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

/// Settles one session inside the caller's transaction.
///
/// A session that already carries `credits_deducted` is replayed without
/// touching the ledger. A class held on a booked slot is paid from the
/// booking's hold first, so it is never billed twice.
pub(crate) fn settle_in(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<SettlementOutcome, DbError> {
    let row = conn
        .query_row(
            "
            SELECT teacher_id, student_id, status, start_time, end_time, duration_minutes,
                   credits_deducted, payment_status, slot_id
            FROM class_sessions
            WHERE id = ?
            ",
            [session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )
        .optional()?;
    let Some((teacher_id, student_id, status, start, end, duration, deducted, stored_status, slot_id)) =
        row
    else {
        return Err(DbError::not_found("session", session_id));
    };

    if let Some(deducted) = deducted {
        let payment_status = match stored_status {
            Some(status) => parse_enum::<PaymentStatus>(&status, session_id)?,
            None => PaymentStatus::Unpaid,
        };
        debug!(session_id, "settlement already processed");
        return Ok(SettlementOutcome::replay(deducted, payment_status));
    }

    let status: SessionStatus = parse_enum(&status, session_id)?;
    if status != SessionStatus::Completed {
        return Err(ValidationError::InvalidState {
            entity: "session",
            id: session_id.to_string(),
            status: status.to_string(),
            expected: "completed",
        }
        .into());
    }
    let minutes = match (duration, end) {
        (Some(minutes), _) => minutes,
        (None, Some(end)) => tc_core::time_range::elapsed_minutes(
            parse_timestamp(&start, session_id)?,
            parse_timestamp(&end, session_id)?,
        ),
        (None, None) => {
            return Err(ValidationError::Empty {
                field: "session duration",
            }
            .into());
        }
    };

    let account = find_account(conn, &student_id, &teacher_id)?;
    let held = match (&account, slot_id.as_deref()) {
        (Some(account), Some(slot_id)) => booking_debit(conn, slot_id)?
            .filter(|(account_id, _)| *account_id == account.id)
            .map_or(0.0, |(_, hours)| hours),
        _ => 0.0,
    };
    let plan = plan_held_settlement(account.as_ref().map(|a| a.balance_hours), minutes, held);
    if let (Some(account), Some(slot_id)) = (
        account.as_ref().filter(|_| plan.released_hours > HOURS_EPSILON),
        slot_id.as_deref(),
    ) {
        let balance_after = adjust_balance(
            conn,
            &account.id,
            TransactionKind::Refund,
            plan.released_hours,
            now,
        )?;
        append_transaction(
            conn,
            LedgerEntry {
                account_id: &account.id,
                kind: TransactionKind::Refund,
                hours: plan.released_hours,
                balance_after,
                reference_type: Some(ReferenceType::SlotBooking),
                reference_id: Some(slot_id),
                description: Some(format!("Unused booking hold after a {minutes} min class")),
            },
            now,
        )?;
    }
    if let Some(account) = account.as_ref().filter(|_| plan.deductible_hours > 0.0) {
        let balance_after = adjust_balance(
            conn,
            &account.id,
            TransactionKind::Deduction,
            plan.deductible_hours,
            now,
        )?;
        append_transaction(
            conn,
            LedgerEntry {
                account_id: &account.id,
                kind: TransactionKind::Deduction,
                hours: plan.deductible_hours,
                balance_after,
                reference_type: Some(ReferenceType::ClassLog),
                reference_id: Some(session_id),
                description: Some(format!("Class of {minutes} min")),
            },
            now,
        )?;
    }

    let outcome = SettlementOutcome::from_plan(&plan);
    let updated = conn.execute(
        "
        UPDATE class_sessions
        SET credits_deducted = ?, payment_status = ?, is_paid = ?, duration_minutes = COALESCE(duration_minutes, ?)
        WHERE id = ? AND credits_deducted IS NULL
        ",
        params![
            outcome.credits_deducted,
            outcome.payment_status.as_str(),
            outcome.is_paid,
            minutes,
            session_id
        ],
    )?;
    if updated != 1 {
        return Err(DbError::conflict("session was settled concurrently", session_id));
    }
    info!(
        session_id,
        minutes,
        held_hours = plan.held_hours,
        credits_deducted = outcome.credits_deducted,
        payment_status = %outcome.payment_status,
        "session settled"
    );
    Ok(outcome)
}

impl Database {
    /// Adds purchased hours, creating the account on first purchase.
    pub fn purchase_credits(
        &mut self,
        purchase: &CreditPurchase,
    ) -> Result<CreditTransaction, DbError> {
        self.purchase_credits_at(purchase, Utc::now())
    }

    pub fn purchase_credits_at(
        &mut self,
        purchase: &CreditPurchase,
        now: DateTime<Utc>,
    ) -> Result<CreditTransaction, DbError> {
        require_non_empty("student id", &purchase.student_id)?;
        require_non_empty("teacher id", &purchase.teacher_id)?;
        let hours = validate_hours(purchase.hours)?;
        if let Some(rate) = purchase.rate_per_hour {
            if !rate.is_finite() || rate < 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: "rate per hour",
                    message: format!("expected a non-negative amount, got {rate}"),
                }
                .into());
            }
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let account_id = ensure_account(&tx, purchase, now)?;
        if purchase.rate_per_hour.is_some() {
            tx.execute(
                "UPDATE credit_accounts SET rate_per_hour = ? WHERE id = ?",
                params![purchase.rate_per_hour, account_id],
            )?;
        }
        let balance_after = adjust_balance(&tx, &account_id, TransactionKind::Purchase, hours, now)?;
        let transaction = append_transaction(
            &tx,
            LedgerEntry {
                account_id: &account_id,
                kind: TransactionKind::Purchase,
                hours,
                balance_after,
                reference_type: purchase
                    .payment_reference
                    .as_ref()
                    .map(|_| ReferenceType::Payment),
                reference_id: purchase.payment_reference.as_deref(),
                description: Some(format!("Purchased {hours} hour(s)")),
            },
            now,
        )?;
        tx.commit()?;

        info!(
            account_id = %account_id,
            hours,
            balance_after,
            "credits purchased"
        );
        Ok(transaction)
    }

    /// The pair's account; `None` means zero credits.
    pub fn credit_account(
        &self,
        student_id: &str,
        teacher_id: &str,
    ) -> Result<Option<CreditAccount>, DbError> {
        find_account(&self.conn, student_id, teacher_id)
    }

    /// Ledger rows for an account in application order.
    pub fn list_credit_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<CreditTransaction>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, account_id, type, hours_amount, balance_after, reference_type, reference_id, description, created_at
            FROM credit_transactions
            WHERE account_id = ?
            ORDER BY rowid ASC
            ",
        )?;
        let rows = stmt.query_map([account_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut transactions = Vec::new();
        for row in rows {
            let (id, account_id, kind, hours, balance_after, ref_type, ref_id, description, created) =
                row?;
            transactions.push(CreditTransaction {
                kind: parse_enum(&kind, &id)?,
                reference_type: ref_type.map(|r| parse_enum(&r, &id)).transpose()?,
                created_at: parse_timestamp(&created, &id)?,
                id,
                account_id,
                hours_amount: hours,
                balance_after,
                reference_id: ref_id,
                description,
            });
        }
        Ok(transactions)
    }

    /// Settles a completed session against its credit account.
    ///
    /// Idempotent: the second and later calls return the stored outcome with
    /// `already_processed = true`.
    pub fn settle_session_at(
        &mut self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = settle_in(&tx, session_id, now)?;
        tx.commit()?;
        Ok(outcome)
    }
}
