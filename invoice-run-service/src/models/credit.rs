//! Customer credits and the append-only credit ledger.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Credit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    Promotional,
    Commitment,
    Goodwill,
    Refund,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Promotional => "promotional",
            CreditKind::Commitment => "commitment",
            CreditKind::Goodwill => "goodwill",
            CreditKind::Refund => "refund",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "commitment" => CreditKind::Commitment,
            "goodwill" => CreditKind::Goodwill,
            "refund" => CreditKind::Refund,
            _ => CreditKind::Promotional,
        }
    }
}

/// Credit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Active,
    Depleted,
    Expired,
    Cancelled,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Active => "active",
            CreditStatus::Depleted => "depleted",
            CreditStatus::Expired => "expired",
            CreditStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "depleted" => CreditStatus::Depleted,
            "expired" => CreditStatus::Expired,
            "cancelled" => CreditStatus::Cancelled,
            _ => CreditStatus::Active,
        }
    }
}

/// A customer-scoped monetary grant. `total_amount` is immutable;
/// `remaining_amount` only ever decreases through ledger-guarded
/// application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Credit {
    pub credit_id: Uuid,
    pub customer_id: Uuid,
    pub kind: String,
    pub description: Option<String>,
    pub total_amount: Decimal,
    pub remaining_amount: Decimal,
    pub currency: String,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    pub allow_carry_over: bool,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Credit {
    pub fn status(&self) -> CreditStatus {
        CreditStatus::from_string(&self.status)
    }

    pub fn kind(&self) -> CreditKind {
        CreditKind::from_string(&self.kind)
    }
}

/// Append-only record of one credit application to one invoice within one
/// run. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditLedgerEntry {
    pub ledger_id: Uuid,
    pub credit_id: Uuid,
    pub invoice_id: Uuid,
    pub run_id: Uuid,
    pub applied_amount: Decimal,
    pub remaining_before: Decimal,
    pub created_utc: DateTime<Utc>,
}

/// Result of applying credits to one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub total_applied: Decimal,
    pub entries: Vec<CreditLedgerEntry>,
    /// Invoice amount left after credit consumption.
    pub final_amount: Decimal,
}
