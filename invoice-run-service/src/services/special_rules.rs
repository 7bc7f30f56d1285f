//! Special rules engine: pre-pricing exclusion, override and reassignment
//! of raw cost entries.
//!
//! A pure, synchronous transform over an in-memory row set. Window and
//! lifecycle filtering happen at load time
//! ([`super::stores::SpecialRuleStore::load_applicable`]); this pass only
//! matches and applies.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::{RawCostEntry, RuleEffect, SkuGroupIndex, SpecialRule, SpecialRuleKind};

/// Result of one application pass over one customer's entries.
#[derive(Debug, Clone, Default)]
pub struct RuleApplication {
    /// Entries still billed to this customer, cost overrides applied.
    pub transformed: Vec<RawCostEntry>,
    /// Entries removed from billed totals.
    pub excluded: Vec<RawCostEntry>,
    /// Entries queued for billing under another customer, keyed by target.
    pub moved: HashMap<Uuid, Vec<RawCostEntry>>,
    /// Per-rule audit aggregates, in rule priority order, matched rules only.
    pub effects: Vec<RuleEffect>,
    /// Net cost delta for this customer across all rule effects.
    pub total_cost_delta: Decimal,
}

/// Apply `rules` to `entries`. Rules are tried in priority order
/// (ascending); the first matching rule wins and no further rules are
/// evaluated for that entry. Entries matching no rule pass through
/// unchanged.
pub fn apply_special_rules(
    entries: Vec<RawCostEntry>,
    rules: &[SpecialRule],
    groups: &SkuGroupIndex,
) -> RuleApplication {
    let mut ordered: Vec<&SpecialRule> = rules.iter().collect();
    ordered.sort_by_key(|rule| (rule.priority, rule.created_utc));

    let mut out = RuleApplication::default();
    let mut effects: HashMap<Uuid, RuleEffect> = HashMap::new();

    for mut entry in entries {
        let matched = ordered
            .iter()
            .find(|rule| rule.matcher().matches(&entry, groups));

        let Some(rule) = matched else {
            out.transformed.push(entry);
            continue;
        };

        let effect = effects
            .entry(rule.rule_id)
            .or_insert_with(|| RuleEffect::new(rule.rule_id));

        match rule.kind() {
            SpecialRuleKind::ExcludeSku | SpecialRuleKind::ExcludeSkuGroup => {
                let delta = -entry.cost;
                effect.record(&entry, delta);
                out.total_cost_delta += delta;
                out.excluded.push(entry);
            }
            SpecialRuleKind::OverrideCost => {
                // A missing multiplier would be a data defect; treat it as
                // the identity transform rather than failing the run.
                let multiplier = rule.cost_multiplier.unwrap_or(Decimal::ONE);
                let new_cost = entry.cost * multiplier;
                let delta = new_cost - entry.cost;
                effect.record(&entry, delta);
                out.total_cost_delta += delta;
                entry.cost = new_cost;
                out.transformed.push(entry);
            }
            SpecialRuleKind::MoveToCustomer => {
                let Some(target) = rule.target_customer_id else {
                    debug!(rule_id = %rule.rule_id, "Move rule without target, passing entry through");
                    out.transformed.push(entry);
                    continue;
                };
                let delta = -entry.cost;
                effect.record(&entry, delta);
                out.total_cost_delta += delta;
                out.moved.entry(target).or_default().push(entry);
            }
        }
    }

    // Report effects in rule priority order.
    out.effects = ordered
        .iter()
        .filter_map(|rule| effects.remove(&rule.rule_id))
        .filter(|effect| effect.matched_rows > 0)
        .collect();

    out
}
