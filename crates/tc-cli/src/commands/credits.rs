//! Credit purchases and balance lookups.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tc_core::{CreditAccount, CreditTransaction};
use tc_db::{CreditPurchase, Database};

use super::util::write_json;
use crate::CreditsAction;

#[derive(Serialize)]
struct AccountView {
    account: CreditAccount,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger: Option<Vec<CreditTransaction>>,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    action: &CreditsAction,
    now: DateTime<Utc>,
) -> Result<()> {
    match action {
        CreditsAction::Purchase {
            student,
            teacher,
            hours,
            rate,
            parent,
            payment_ref,
        } => {
            let purchase = CreditPurchase {
                student_id: student.clone(),
                teacher_id: teacher.clone(),
                parent_id: parent.clone(),
                hours: *hours,
                rate_per_hour: *rate,
                payment_reference: payment_ref.clone(),
            };
            let transaction = db
                .purchase_credits_at(&purchase, now)
                .context("failed to record purchase")?;
            write_json(writer, &transaction)
        }
        CreditsAction::Show {
            student,
            teacher,
            ledger,
        } => {
            let Some(account) = db.credit_account(student, teacher)? else {
                anyhow::bail!("no credit account for student {student} with teacher {teacher}");
            };
            let ledger = if *ledger {
                Some(db.list_credit_transactions(&account.id)?)
            } else {
                None
            };
            write_json(writer, &AccountView { account, ledger })
        }
    }
}
