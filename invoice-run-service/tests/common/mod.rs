//! Test helper module for invoice-run-service tests.
//!
//! Provides in-memory store implementations so the engines and the run
//! orchestrator can be exercised without PostgreSQL, plus fixture builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use invoice_run_service::models::{
    BillingMonth, Credit, CreditLedgerEntry, CreditStatus, Customer, Invoice, InvoiceLineItem,
    InvoiceRun, InvoiceRunStatus, InvoiceStatus, NewInvoice, NewLineItem, PricingRule,
    RawCostEntry, RuleEffect, RunSummary, SkuGroupIndex, SkuGroupMember, SpecialRule,
    SpecialRuleKind,
};
use invoice_run_service::services::stores::{
    CostStore, CreditStore, CustomerStore, InvoiceStore, PricingStore, RunStore, SkuGroupStore,
    SpecialRuleStore,
};
use invoice_run_service::services::{eligible_credits, DiscountPricing, RunOrchestrator};

/// Shared in-memory backing store implementing every repository trait.
#[derive(Default)]
pub struct InMemoryStore {
    pub customers: Mutex<Vec<Customer>>,
    pub entries: Mutex<Vec<RawCostEntry>>,
    pub sku_members: Mutex<Vec<SkuGroupMember>>,
    pub special_rules: Mutex<Vec<SpecialRule>>,
    pub pricing_rules: Mutex<HashMap<Uuid, Vec<PricingRule>>>,
    pub credits: Mutex<Vec<Credit>>,
    pub credit_ledger: Mutex<Vec<CreditLedgerEntry>>,
    pub rule_effects: Mutex<Vec<(Uuid, Uuid, RuleEffect)>>,
    pub invoices: Mutex<Vec<Invoice>>,
    pub line_items: Mutex<Vec<InvoiceLineItem>>,
    pub runs: Mutex<Vec<InvoiceRun>>,
    /// When set, pricing-rule loading fails for this customer. Used to
    /// exercise partial-failure semantics.
    pub fail_pricing_for: Mutex<Option<Uuid>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_customer(&self, customer: Customer) {
        self.customers.lock().unwrap().push(customer);
    }

    pub fn add_entry(&self, entry: RawCostEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn add_special_rule(&self, rule: SpecialRule) {
        self.special_rules.lock().unwrap().push(rule);
    }

    pub fn add_pricing_rule(&self, customer_id: Uuid, rule: PricingRule) {
        self.pricing_rules
            .lock()
            .unwrap()
            .entry(customer_id)
            .or_default()
            .push(rule);
    }

    pub fn add_credit(&self, credit: Credit) {
        self.credits.lock().unwrap().push(credit);
    }

    pub fn add_sku_member(&self, group_id: Uuid, sku_id: &str) {
        self.sku_members.lock().unwrap().push(SkuGroupMember {
            group_id,
            sku_id: sku_id.to_string(),
        });
    }

    pub fn credit(&self, credit_id: Uuid) -> Credit {
        self.credits
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.credit_id == credit_id)
            .cloned()
            .expect("credit exists")
    }

    pub fn invoice(&self, invoice_id: Uuid) -> Invoice {
        self.invoices
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned()
            .expect("invoice exists")
    }

    pub fn run(&self, run_id: Uuid) -> InvoiceRun {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .expect("run exists")
    }

    pub fn ledger_for_credit(&self, credit_id: Uuid) -> Vec<CreditLedgerEntry> {
        self.credit_ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.credit_id == credit_id)
            .cloned()
            .collect()
    }

    pub fn items_for_invoice(&self, invoice_id: Uuid) -> Vec<InvoiceLineItem> {
        self.line_items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CustomerStore for InMemoryStore {
    async fn list_active(&self) -> Result<Vec<Customer>, AppError> {
        let mut active: Vec<Customer> = self
            .customers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|c| c.customer_id);
        Ok(active)
    }

    async fn get(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self
            .customers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.customer_id == customer_id)
            .cloned())
    }
}

#[async_trait]
impl CostStore for InMemoryStore {
    async fn load_entries(
        &self,
        billing_account_id: &str,
        month: BillingMonth,
        batch_id: Option<Uuid>,
    ) -> Result<Vec<RawCostEntry>, AppError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.billing_account_id == billing_account_id)
            .filter(|e| e.usage_start >= month.start_instant() && e.usage_start < month.end_instant())
            .filter(|e| batch_id.map(|b| e.batch_id == b).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SkuGroupStore for InMemoryStore {
    async fn load_index(&self) -> Result<SkuGroupIndex, AppError> {
        let members = self.sku_members.lock().unwrap().clone();
        Ok(SkuGroupIndex::from_members(members))
    }
}

#[async_trait]
impl SpecialRuleStore for InMemoryStore {
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<SpecialRule>, AppError> {
        let mut rules: Vec<SpecialRule> = self
            .special_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.customer_id.is_none() || r.customer_id == Some(customer_id))
            .filter(|r| r.lifecycle == "active")
            .filter(|r| month.overlaps(r.effective_from, r.effective_to))
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.priority, r.created_utc));
        Ok(rules)
    }

    async fn record_effects(
        &self,
        run_id: Uuid,
        customer_id: Uuid,
        effects: &[RuleEffect],
    ) -> Result<(), AppError> {
        let mut ledger = self.rule_effects.lock().unwrap();
        for effect in effects {
            ledger.push((run_id, customer_id, effect.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl PricingStore for InMemoryStore {
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<PricingRule>, AppError> {
        if *self.fail_pricing_for.lock().unwrap() == Some(customer_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected pricing failure for customer {}",
                customer_id
            )));
        }

        Ok(self
            .pricing_rules
            .lock()
            .unwrap()
            .get(&customer_id)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| month.overlaps(r.effective_from, r.effective_to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CreditStore for InMemoryStore {
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Credit>, AppError> {
        let credits: Vec<Credit> = self
            .credits
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(eligible_credits(&credits, month))
    }

    async fn apply_credit(
        &self,
        credit_id: Uuid,
        invoice_id: Uuid,
        run_id: Uuid,
        requested: Decimal,
    ) -> Result<Option<CreditLedgerEntry>, AppError> {
        if requested <= Decimal::ZERO {
            return Ok(None);
        }

        let mut credits = self.credits.lock().unwrap();
        let credit = credits
            .iter_mut()
            .find(|c| c.credit_id == credit_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Credit {} not found", credit_id)))?;

        if credit.status() != CreditStatus::Active || credit.remaining_amount <= Decimal::ZERO {
            return Ok(None);
        }

        let applied = requested.min(credit.remaining_amount);
        let entry = CreditLedgerEntry {
            ledger_id: Uuid::new_v4(),
            credit_id,
            invoice_id,
            run_id,
            applied_amount: applied,
            remaining_before: credit.remaining_amount,
            created_utc: Utc::now(),
        };

        credit.remaining_amount -= applied;
        if credit.remaining_amount == Decimal::ZERO {
            credit.status = CreditStatus::Depleted.as_str().to_string();
        }
        credit.updated_utc = Utc::now();

        self.credit_ledger.lock().unwrap().push(entry.clone());
        Ok(Some(entry))
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn create_with_line_items(
        &self,
        invoice: NewInvoice,
        items: Vec<NewLineItem>,
    ) -> Result<Invoice, AppError> {
        let now = Utc::now();
        let created = Invoice {
            invoice_id: Uuid::new_v4(),
            run_id: invoice.run_id,
            customer_id: invoice.customer_id,
            billing_month: invoice.billing_month,
            currency: invoice.currency,
            raw_subtotal: invoice.raw_subtotal,
            subtotal: invoice.subtotal,
            credit_applied: Decimal::ZERO,
            total: invoice.subtotal,
            status: InvoiceStatus::Draft.as_str().to_string(),
            locked_at: None,
            locked_by: None,
            created_utc: now,
            updated_utc: now,
        };

        let mut stored_items = self.line_items.lock().unwrap();
        for item in items {
            stored_items.push(InvoiceLineItem {
                line_item_id: Uuid::new_v4(),
                invoice_id: created.invoice_id,
                service_id: item.service_id,
                sku_id: item.sku_id,
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
                amount: item.amount,
                list_amount: item.list_amount,
                pricing_rule_id: item.pricing_rule_id,
                sort_order: item.sort_order,
                provenance: item.provenance,
                created_utc: now,
            });
        }

        self.invoices.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn apply_credit_totals(
        &self,
        invoice_id: Uuid,
        credit_applied: Decimal,
        total: Decimal,
    ) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
            })?;

        if invoice.is_locked() || invoice.status() != InvoiceStatus::Draft {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is locked or no longer draft",
                invoice_id
            )));
        }

        invoice.credit_applied = credit_applied;
        invoice.total = total;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned())
    }

    async fn lock(&self, invoice_id: Uuid, actor: &str) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
            })?;

        if invoice.is_locked() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is already locked",
                invoice_id
            )));
        }

        invoice.status = InvoiceStatus::Locked.as_str().to_string();
        invoice.locked_at = Some(Utc::now());
        invoice.locked_by = Some(actor.to_string());
        invoice.updated_utc = Utc::now();
        let locked = invoice.clone();

        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter_mut().find(|r| r.run_id == locked.run_id) {
            run.status = InvoiceRunStatus::Locked.as_str().to_string();
            run.updated_utc = Utc::now();
        }

        Ok(locked)
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn find_by_key(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<Option<InvoiceRun>, AppError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.billing_month == month.first_day()
                    && r.target_customer_id == target_customer_id
                    && r.source_key == source_key
            })
            .cloned())
    }

    async fn find_locked(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.billing_month == month.first_day() && r.status() == InvoiceRunStatus::Locked
            })
            .cloned())
    }

    async fn find_in_flight(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.billing_month == month.first_day()
                    && matches!(
                        r.status(),
                        InvoiceRunStatus::Queued | InvoiceRunStatus::Running
                    )
            })
            .cloned())
    }

    async fn insert_queued(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        ingestion_batch_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<InvoiceRun, AppError> {
        let mut runs = self.runs.lock().unwrap();

        let duplicate = runs.iter().any(|r| {
            r.billing_month == month.first_day()
                && ((r.source_key == source_key && r.target_customer_id == target_customer_id)
                    || matches!(
                        r.status(),
                        InvoiceRunStatus::Queued | InvoiceRunStatus::Running
                    ))
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A run already exists for billing month {}",
                month
            )));
        }

        let now = Utc::now();
        let run = InvoiceRun {
            run_id: Uuid::new_v4(),
            billing_month: month.first_day(),
            target_customer_id,
            ingestion_batch_id,
            source_key: source_key.to_string(),
            status: InvoiceRunStatus::Queued.as_str().to_string(),
            started_utc: None,
            completed_utc: None,
            customers_processed: 0,
            customers_failed: 0,
            invoices_created: 0,
            rows_processed: 0,
            projects_processed: 0,
            raw_total: Decimal::ZERO,
            priced_total: Decimal::ZERO,
            discount_total: Decimal::ZERO,
            credit_total: Decimal::ZERO,
            final_total: Decimal::ZERO,
            currency_breakdown: None,
            errors: None,
            created_utc: now,
            updated_utc: now,
        };
        runs.push(run.clone());
        Ok(run)
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<InvoiceRun>, AppError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn begin_execution(&self, run_id: Uuid) -> Result<bool, AppError> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.iter_mut().find(|r| r.run_id == run_id) else {
            return Ok(false);
        };
        if run.status() != InvoiceRunStatus::Queued {
            return Ok(false);
        }
        run.status = InvoiceRunStatus::Running.as_str().to_string();
        run.started_utc = Some(Utc::now());
        run.updated_utc = Utc::now();
        Ok(true)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: InvoiceRunStatus,
        summary: &RunSummary,
    ) -> Result<InvoiceRun, AppError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Run {} not found", run_id)))?;

        if run.status() != InvoiceRunStatus::Running {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Run {} is no longer running and cannot be finished",
                run_id
            )));
        }

        run.status = status.as_str().to_string();
        run.completed_utc = Some(Utc::now());
        run.customers_processed = summary.customers_processed;
        run.customers_failed = summary.customers_failed;
        run.invoices_created = summary.invoices_created;
        run.rows_processed = summary.rows_processed;
        run.projects_processed = summary.projects_processed;
        run.raw_total = summary.raw_total;
        run.priced_total = summary.priced_total;
        run.discount_total = summary.discount_total;
        run.credit_total = summary.credit_total;
        run.final_total = summary.final_total;
        run.currency_breakdown = Some(summary.currency_breakdown.clone());
        run.errors = serde_json::to_value(&summary.errors).ok();
        run.updated_utc = Utc::now();
        Ok(run.clone())
    }
}

/// Wire an orchestrator over one shared in-memory store.
pub fn orchestrator(store: &Arc<InMemoryStore>) -> RunOrchestrator {
    RunOrchestrator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(DiscountPricing),
    )
}

// -----------------------------------------------------------------------------
// Fixture builders
// -----------------------------------------------------------------------------

pub fn month(s: &str) -> BillingMonth {
    s.parse().expect("valid billing month")
}

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("valid decimal")
}

pub fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

pub fn customer(name: &str, billing_account_id: &str) -> Customer {
    Customer {
        customer_id: Uuid::new_v4(),
        name: name.to_string(),
        billing_account_id: billing_account_id.to_string(),
        currency: "USD".to_string(),
        is_active: true,
        created_utc: Utc::now(),
    }
}

pub fn entry(
    billing_account_id: &str,
    project_id: &str,
    service_id: &str,
    sku_id: &str,
    cost: &str,
    billing_month: BillingMonth,
) -> RawCostEntry {
    let usage_start = billing_month.start_instant() + Duration::hours(6);
    RawCostEntry {
        entry_id: Uuid::new_v4(),
        batch_id: Uuid::new_v4(),
        billing_account_id: billing_account_id.to_string(),
        project_id: project_id.to_string(),
        service_id: service_id.to_string(),
        sku_id: sku_id.to_string(),
        usage_start,
        usage_end: usage_start + Duration::hours(1),
        usage_amount: Decimal::ONE,
        cost: dec(cost),
        currency: "USD".to_string(),
        region: None,
        checksum: Uuid::new_v4().to_string(),
        created_utc: Utc::now(),
    }
}

/// A rule with no match predicates (matches everything) covering `billing_month`.
pub fn special_rule(
    kind: SpecialRuleKind,
    priority: i32,
    billing_month: BillingMonth,
) -> SpecialRule {
    SpecialRule {
        rule_id: Uuid::new_v4(),
        customer_id: None,
        name: format!("{} rule", kind.as_str()),
        kind: kind.as_str().to_string(),
        priority,
        match_sku_id: None,
        match_sku_group_id: None,
        match_service_id: None,
        match_project_id: None,
        match_billing_account_id: None,
        cost_multiplier: None,
        target_customer_id: None,
        effective_from: billing_month.first_day(),
        effective_to: Some(billing_month.last_day()),
        lifecycle: "active".to_string(),
        created_utc: Utc::now(),
    }
}

pub fn pricing_rule(
    sku_group_id: Option<Uuid>,
    discount_rate: &str,
    priority: i32,
    billing_month: BillingMonth,
) -> PricingRule {
    PricingRule {
        rule_id: Uuid::new_v4(),
        list_id: Uuid::new_v4(),
        sku_group_id,
        discount_rate: dec(discount_rate),
        priority,
        effective_from: billing_month.first_day(),
        effective_to: None,
        created_utc: Utc::now(),
    }
}

pub fn credit(
    customer_id: Uuid,
    total: &str,
    valid_from: NaiveDate,
    valid_to: NaiveDate,
    allow_carry_over: bool,
) -> Credit {
    let now = Utc::now();
    Credit {
        credit_id: Uuid::new_v4(),
        customer_id,
        kind: "promotional".to_string(),
        description: None,
        total_amount: dec(total),
        remaining_amount: dec(total),
        currency: "USD".to_string(),
        valid_from,
        valid_to,
        allow_carry_over,
        status: "active".to_string(),
        created_utc: now,
        updated_utc: now,
    }
}
