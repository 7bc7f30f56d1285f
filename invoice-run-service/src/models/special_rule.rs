//! Special rules: pre-pricing transforms over raw cost entries.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{RawCostEntry, SkuGroupIndex};

/// Special rule type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialRuleKind {
    ExcludeSku,
    ExcludeSkuGroup,
    OverrideCost,
    MoveToCustomer,
}

impl SpecialRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialRuleKind::ExcludeSku => "exclude_sku",
            SpecialRuleKind::ExcludeSkuGroup => "exclude_sku_group",
            SpecialRuleKind::OverrideCost => "override_cost",
            SpecialRuleKind::MoveToCustomer => "move_to_customer",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "exclude_sku_group" => SpecialRuleKind::ExcludeSkuGroup,
            "override_cost" => SpecialRuleKind::OverrideCost,
            "move_to_customer" => SpecialRuleKind::MoveToCustomer,
            _ => SpecialRuleKind::ExcludeSku,
        }
    }
}

/// A customer-scoped or global (customer_id = NULL) matching rule applied
/// before pricing. Lifecycle is an explicit state: retired rules stay in the
/// table for audit history but are never loaded for new runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SpecialRule {
    pub rule_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub name: String,
    pub kind: String,
    pub priority: i32,
    pub match_sku_id: Option<String>,
    pub match_sku_group_id: Option<Uuid>,
    pub match_service_id: Option<String>,
    pub match_project_id: Option<String>,
    pub match_billing_account_id: Option<String>,
    pub cost_multiplier: Option<Decimal>,
    pub target_customer_id: Option<Uuid>,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub lifecycle: String,
    pub created_utc: DateTime<Utc>,
}

impl SpecialRule {
    pub fn kind(&self) -> SpecialRuleKind {
        SpecialRuleKind::from_string(&self.kind)
    }

    pub fn matcher(&self) -> RuleMatch<'_> {
        RuleMatch {
            sku_id: self.match_sku_id.as_deref(),
            sku_group_id: self.match_sku_group_id,
            service_id: self.match_service_id.as_deref(),
            project_id: self.match_project_id.as_deref(),
            billing_account_id: self.match_billing_account_id.as_deref(),
        }
    }
}

/// Explicit match predicate: a `None` field is a wildcard, every `Some`
/// field must equal the corresponding entry field.
#[derive(Debug, Clone, Copy)]
pub struct RuleMatch<'a> {
    pub sku_id: Option<&'a str>,
    pub sku_group_id: Option<Uuid>,
    pub service_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub billing_account_id: Option<&'a str>,
}

impl RuleMatch<'_> {
    /// AND-fold over the present predicates.
    pub fn matches(&self, entry: &RawCostEntry, groups: &SkuGroupIndex) -> bool {
        let checks = [
            self.sku_id.map(|sku| sku == entry.sku_id),
            self.sku_group_id
                .map(|group| groups.contains(&entry.sku_id, group)),
            self.service_id.map(|service| service == entry.service_id),
            self.project_id.map(|project| project == entry.project_id),
            self.billing_account_id
                .map(|account| account == entry.billing_account_id),
        ];
        checks.into_iter().flatten().all(|matched| matched)
    }
}

/// Per-rule audit aggregate produced by one application pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEffect {
    pub rule_id: Uuid,
    pub matched_rows: i64,
    pub cost_delta: Decimal,
    pub delta_by_project: BTreeMap<String, Decimal>,
    pub delta_by_sku: BTreeMap<String, Decimal>,
}

impl RuleEffect {
    pub fn new(rule_id: Uuid) -> Self {
        Self {
            rule_id,
            matched_rows: 0,
            cost_delta: Decimal::ZERO,
            delta_by_project: BTreeMap::new(),
            delta_by_sku: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, entry: &RawCostEntry, delta: Decimal) {
        self.matched_rows += 1;
        self.cost_delta += delta;
        *self
            .delta_by_project
            .entry(entry.project_id.clone())
            .or_insert(Decimal::ZERO) += delta;
        *self
            .delta_by_sku
            .entry(entry.sku_id.clone())
            .or_insert(Decimal::ZERO) += delta;
    }
}

/// Append-only persisted form of a [`RuleEffect`] for one run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RuleEffectLedgerEntry {
    pub ledger_id: Uuid,
    pub run_id: Uuid,
    pub customer_id: Uuid,
    pub rule_id: Uuid,
    pub matched_rows: i64,
    pub cost_delta: Decimal,
    pub breakdown: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}
