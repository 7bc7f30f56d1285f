//! Credits engine: consumes customer credit balances against the priced
//! invoice total, oldest credit first, one ledger-guarded transaction per
//! application.

use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{BillingMonth, Credit, CreditOutcome, CreditStatus};
use crate::services::stores::CreditStore;

/// Month-eligibility filter, mirrored by the Postgres query in
/// `Database::load_applicable`: active, remaining balance, window overlap,
/// and the carry-over restriction (a credit that may not carry over is
/// only usable in the month its validity started in). Ordered `valid_from`
/// ascending.
pub fn eligible_credits(credits: &[Credit], month: BillingMonth) -> Vec<Credit> {
    let mut eligible: Vec<Credit> = credits
        .iter()
        .filter(|credit| credit.status() == CreditStatus::Active)
        .filter(|credit| credit.remaining_amount > Decimal::ZERO)
        .filter(|credit| month.overlaps(credit.valid_from, Some(credit.valid_to)))
        .filter(|credit| credit.allow_carry_over || month.contains(credit.valid_from))
        .cloned()
        .collect();
    eligible.sort_by_key(|credit| (credit.valid_from, credit.created_utc));
    eligible
}

/// Walks eligible credits and applies them to one invoice.
pub struct CreditsEngine {
    store: Arc<dyn CreditStore>,
}

impl CreditsEngine {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Consume credits against `invoice_amount` until it reaches zero or
    /// the eligible credits are exhausted. Each non-zero application is one
    /// database transaction; the store clamps against the live remaining
    /// amount so concurrent runs cannot double-spend a credit.
    #[instrument(skip(self), fields(customer_id = %customer_id, invoice_id = %invoice_id))]
    pub async fn apply_to_invoice(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        run_id: Uuid,
        invoice_amount: Decimal,
        currency: &str,
        month: BillingMonth,
    ) -> Result<CreditOutcome, AppError> {
        let mut outcome = CreditOutcome {
            total_applied: Decimal::ZERO,
            entries: Vec::new(),
            final_amount: invoice_amount,
        };

        if invoice_amount <= Decimal::ZERO {
            return Ok(outcome);
        }

        let credits = self.store.load_applicable(customer_id, month).await?;

        for credit in credits {
            if outcome.final_amount <= Decimal::ZERO {
                break;
            }
            if credit.currency != currency {
                continue;
            }

            let entry = self
                .store
                .apply_credit(credit.credit_id, invoice_id, run_id, outcome.final_amount)
                .await?;

            if let Some(entry) = entry {
                outcome.total_applied += entry.applied_amount;
                outcome.final_amount -= entry.applied_amount;
                outcome.entries.push(entry);
            }
        }

        info!(
            applied = %outcome.total_applied,
            remaining = %outcome.final_amount,
            applications = outcome.entries.len(),
            "Credits applied to invoice"
        );

        Ok(outcome)
    }
}
