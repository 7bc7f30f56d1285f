//! Pricing engine: applies SKU-group discount rules to rule-transformed
//! entries.
//!
//! The selection contract: scoped rules (whose SKU group contains the
//! entry's SKU) are preferred over catch-all rules (NULL scope); within
//! each class the lowest priority value wins, and equal priorities are
//! resolved by the most recently created rule. A rule applies only when its
//! effective window covers the entry's usage start date. No matching rule
//! leaves the entry at list price.

use rust_decimal::Decimal;
use std::cmp::Reverse;

use crate::models::{PricedEntry, PricingOutcome, PricingRule, RawCostEntry, SkuGroupIndex};

/// Discounting contract between the orchestrator and the pricing stage.
pub trait PricingEngine: Send + Sync {
    fn price(
        &self,
        entries: Vec<RawCostEntry>,
        rules: &[PricingRule],
        groups: &SkuGroupIndex,
    ) -> PricingOutcome;
}

/// Shipped implementation: per-entry discount against the customer's
/// pricing rules.
#[derive(Debug, Default)]
pub struct DiscountPricing;

impl DiscountPricing {
    fn best_rule<'a>(
        entry: &RawCostEntry,
        rules: &'a [PricingRule],
        groups: &SkuGroupIndex,
    ) -> Option<&'a PricingRule> {
        let usage_date = entry.usage_start.date_naive();

        rules
            .iter()
            .filter(|rule| rule.covers(usage_date))
            .filter(|rule| match rule.sku_group_id {
                Some(group) => groups.contains(&entry.sku_id, group),
                None => true,
            })
            .min_by_key(|rule| {
                (
                    rule.sku_group_id.is_none(),
                    rule.priority,
                    Reverse(rule.created_utc),
                )
            })
    }
}

impl PricingEngine for DiscountPricing {
    fn price(
        &self,
        entries: Vec<RawCostEntry>,
        rules: &[PricingRule],
        groups: &SkuGroupIndex,
    ) -> PricingOutcome {
        let mut outcome = PricingOutcome::default();

        for entry in entries {
            let rule = Self::best_rule(&entry, rules, groups);
            let list_amount = entry.cost;
            let billed_amount = match rule {
                Some(rule) => list_amount * rule.discount_rate,
                None => list_amount,
            };

            outcome.raw_total += list_amount;
            outcome.total += billed_amount;
            outcome.lines.push(PricedEntry {
                entry,
                list_amount,
                billed_amount,
                pricing_rule_id: rule.map(|r| r.rule_id),
            });
        }

        outcome
    }
}

/// Total discount granted by an outcome.
pub fn discount_total(outcome: &PricingOutcome) -> Decimal {
    outcome.raw_total - outcome.total
}
