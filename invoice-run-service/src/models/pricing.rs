//! Pricing lists and SKU-group discount rules.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::RawCostEntry;

/// A customer's pricing list. Rules hang off the list.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PricingList {
    pub list_id: Uuid,
    pub customer_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

/// A discount rule. `discount_rate` is the fraction of list price retained
/// (0.90 = 10% off). `sku_group_id = NULL` is the catch-all scope.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PricingRule {
    pub rule_id: Uuid,
    pub list_id: Uuid,
    pub sku_group_id: Option<Uuid>,
    pub discount_rate: Decimal,
    pub priority: i32,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

impl PricingRule {
    /// Whether the rule's effective window covers `date`.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.map(|to| to >= date).unwrap_or(true)
    }
}

/// One rule-transformed entry after discounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricedEntry {
    pub entry: RawCostEntry,
    pub list_amount: Decimal,
    pub billed_amount: Decimal,
    pub pricing_rule_id: Option<Uuid>,
}

/// Result of pricing one customer's entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingOutcome {
    pub lines: Vec<PricedEntry>,
    /// Pre-discount (list price) total.
    pub raw_total: Decimal,
    /// Post-discount total.
    pub total: Decimal,
}
