//! Invoice run orchestrator: idempotent run creation, pipeline execution
//! per customer, and the one-way invoice lock.

use anyhow::anyhow;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    BillingMonth, Customer, CustomerRunError, CustomerRunResult, Invoice, InvoiceRun,
    InvoiceRunStatus, NewInvoice, NewLineItem, PricingOutcome, RawCostEntry, RunCreation,
    RunReport, RunSummary,
};
use crate::services::credits::CreditsEngine;
use crate::services::metrics::{record_invoice_created, record_run_finished};
use crate::services::pricing::PricingEngine;
use crate::services::special_rules::{apply_special_rules, RuleApplication};
use crate::services::stores::{
    CostStore, CreditStore, CustomerStore, InvoiceStore, PricingStore, RunStore, SkuGroupStore,
    SpecialRuleStore,
};

/// Deterministic idempotency key for a run-creation request: hash of the
/// billing month and the cost-data selector.
pub fn source_key(month: BillingMonth, ingestion_batch_id: Option<Uuid>) -> String {
    let selector = ingestion_batch_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "all-batches".to_string());

    let mut hasher = Sha256::new();
    hasher.update(month.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(selector.as_bytes());
    hex::encode(hasher.finalize())
}

/// Input for run creation.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub month: BillingMonth,
    pub target_customer_id: Option<Uuid>,
    pub ingestion_batch_id: Option<Uuid>,
}

/// One customer staged after the special-rules pass.
struct StagedCustomer {
    customer: Customer,
    application: RuleApplication,
    loaded_rows: i64,
}

/// Top-level state machine over the three-stage pipeline.
pub struct RunOrchestrator {
    customers: Arc<dyn CustomerStore>,
    costs: Arc<dyn CostStore>,
    sku_groups: Arc<dyn SkuGroupStore>,
    special_rules: Arc<dyn SpecialRuleStore>,
    pricing_rules: Arc<dyn PricingStore>,
    invoices: Arc<dyn InvoiceStore>,
    runs: Arc<dyn RunStore>,
    credits: CreditsEngine,
    pricer: Arc<dyn PricingEngine>,
}

impl RunOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        customers: Arc<dyn CustomerStore>,
        costs: Arc<dyn CostStore>,
        sku_groups: Arc<dyn SkuGroupStore>,
        special_rules: Arc<dyn SpecialRuleStore>,
        pricing_rules: Arc<dyn PricingStore>,
        credits: Arc<dyn CreditStore>,
        invoices: Arc<dyn InvoiceStore>,
        runs: Arc<dyn RunStore>,
        pricer: Arc<dyn PricingEngine>,
    ) -> Self {
        Self {
            customers,
            costs,
            sku_groups,
            special_rules,
            pricing_rules,
            invoices,
            runs,
            credits: CreditsEngine::new(credits),
            pricer,
        }
    }

    /// Create (or idempotently return) a run for a billing month.
    ///
    /// Duplicate-submission defense: an existing run with the same
    /// `(month, target, source_key)` is returned unchanged. A locked month
    /// is a hard conflict; a queued/running run with a different key is a
    /// soft conflict.
    #[instrument(skip(self), fields(month = %request.month))]
    pub async fn create_run(&self, request: CreateRun) -> Result<RunCreation, AppError> {
        let key = source_key(request.month, request.ingestion_batch_id);

        if let Some(existing) = self
            .runs
            .find_by_key(request.month, request.target_customer_id, &key)
            .await?
        {
            info!(run_id = %existing.run_id, "Run creation matched an existing run");
            return Ok(RunCreation {
                run: existing,
                idempotent: true,
            });
        }

        if let Some(locked) = self.runs.find_locked(request.month).await? {
            return Err(AppError::Conflict(anyhow!(
                "billing month {} is locked (run {})",
                request.month,
                locked.run_id
            )));
        }

        if let Some(active) = self.runs.find_in_flight(request.month).await? {
            return Err(AppError::Conflict(anyhow!(
                "an invoice run is already in progress for {} (run {}, status {})",
                request.month,
                active.run_id,
                active.status
            )));
        }

        let inserted = self
            .runs
            .insert_queued(
                request.month,
                request.target_customer_id,
                request.ingestion_batch_id,
                &key,
            )
            .await;

        match inserted {
            Ok(run) => {
                info!(run_id = %run.run_id, source_key = %key, "Invoice run queued");
                Ok(RunCreation {
                    run,
                    idempotent: false,
                })
            }
            // Two concurrent creates can both pass the checks above; the
            // unique index decides. If the winner carried our key this is
            // the idempotent case after all.
            Err(AppError::Conflict(cause)) => {
                if let Some(existing) = self
                    .runs
                    .find_by_key(request.month, request.target_customer_id, &key)
                    .await?
                {
                    return Ok(RunCreation {
                        run: existing,
                        idempotent: true,
                    });
                }
                Err(AppError::Conflict(cause))
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a queued run: pipeline every target customer, persist
    /// invoices and ledgers, record result metadata. Per-customer failures
    /// are collected; committed invoices are never rolled back.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute_run(&self, run_id: Uuid) -> Result<RunReport, AppError> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("invoice run {} not found", run_id)))?;

        match run.status() {
            InvoiceRunStatus::Queued => {}
            InvoiceRunStatus::Running => {
                return Err(AppError::Conflict(anyhow!(
                    "invoice run {} is already executing",
                    run_id
                )));
            }
            status => {
                return Err(AppError::Conflict(anyhow!(
                    "invoice run {} is {} and cannot be executed again",
                    run_id,
                    status.as_str()
                )));
            }
        }

        if !self.runs.begin_execution(run_id).await? {
            return Err(AppError::Conflict(anyhow!(
                "invoice run {} was picked up by another executor",
                run_id
            )));
        }

        let month = BillingMonth::from_date(run.billing_month);
        let report = self.run_pipeline(&run, month).await;

        match report {
            Ok(report) => Ok(report),
            Err(e) => {
                // Infrastructure failure before per-customer handling could
                // absorb it: mark the run failed with the error recorded.
                warn!(error = %e, "Run execution failed before completion");
                let summary = RunSummary {
                    errors: vec![CustomerRunError {
                        customer_id: Uuid::nil(),
                        message: e.to_string(),
                    }],
                    ..RunSummary::default()
                };
                self.runs
                    .finish(run_id, InvoiceRunStatus::Failed, &summary)
                    .await?;
                record_run_finished(InvoiceRunStatus::Failed.as_str());
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        run: &InvoiceRun,
        month: BillingMonth,
    ) -> Result<RunReport, AppError> {
        let groups = self.sku_groups.load_index().await?;

        let targets: Vec<Customer> = match run.target_customer_id {
            Some(customer_id) => {
                let customer = self.customers.get(customer_id).await?.ok_or_else(|| {
                    AppError::NotFound(anyhow!("customer {} not found", customer_id))
                })?;
                vec![customer]
            }
            None => self.customers.list_active().await?,
        };

        let mut summary = RunSummary::default();
        let mut results: Vec<CustomerRunResult> = Vec::new();
        let mut staged: Vec<StagedCustomer> = Vec::new();
        let mut moved: HashMap<Uuid, Vec<RawCostEntry>> = HashMap::new();
        let mut projects: BTreeSet<String> = BTreeSet::new();
        let mut currency_totals: BTreeMap<String, Decimal> = BTreeMap::new();

        // Phase one: load and rule-transform every customer, so entries
        // moved between customers are staged before anyone is priced.
        for customer in targets {
            let outcome: Result<(RuleApplication, i64), AppError> = async {
                let entries = self
                    .costs
                    .load_entries(&customer.billing_account_id, month, run.ingestion_batch_id)
                    .await?;
                let rules = self
                    .special_rules
                    .load_applicable(customer.customer_id, month)
                    .await?;
                let loaded_rows = entries.len() as i64;
                for entry in &entries {
                    projects.insert(entry.project_id.clone());
                }
                Ok((apply_special_rules(entries, &rules, &groups), loaded_rows))
            }
            .await;

            match outcome {
                Ok((mut application, loaded_rows)) => {
                    for (target, entries) in application.moved.drain() {
                        moved.entry(target).or_default().extend(entries);
                    }
                    staged.push(StagedCustomer {
                        customer,
                        application,
                        loaded_rows,
                    });
                }
                Err(e) => {
                    warn!(customer_id = %customer.customer_id, error = %e, "Customer staging failed");
                    summary.customers_processed += 1;
                    summary.customers_failed += 1;
                    summary.errors.push(CustomerRunError {
                        customer_id: customer.customer_id,
                        message: e.to_string(),
                    });
                    results.push(CustomerRunResult {
                        customer_id: customer.customer_id,
                        invoice_id: None,
                        rows: 0,
                        raw_total: Decimal::ZERO,
                        priced_total: Decimal::ZERO,
                        credit_applied: Decimal::ZERO,
                        final_total: Decimal::ZERO,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        // Entries moved to customers outside this run's scope cannot be
        // billed here; they are dropped with a warning.
        let staged_ids: BTreeSet<Uuid> = staged.iter().map(|s| s.customer.customer_id).collect();
        for (target, entries) in moved.iter() {
            if !staged_ids.contains(target) {
                warn!(
                    target_customer_id = %target,
                    entry_count = entries.len(),
                    "Entries moved to a customer outside the run scope were not billed"
                );
            }
        }

        // Phase two: price, persist and consume credits per customer.
        for stage in staged {
            let customer_id = stage.customer.customer_id;
            let incoming = moved.remove(&customer_id).unwrap_or_default();

            summary.customers_processed += 1;
            summary.rows_processed += stage.loaded_rows;

            let billed = self
                .bill_customer(run, month, stage, incoming, &groups, &mut currency_totals)
                .await;

            match billed {
                Ok(result) => {
                    summary.raw_total += result.raw_total;
                    summary.priced_total += result.priced_total;
                    summary.credit_total += result.credit_applied;
                    summary.final_total += result.final_total;
                    if result.invoice_id.is_some() {
                        summary.invoices_created += 1;
                    }
                    results.push(result);
                }
                Err(e) => {
                    warn!(customer_id = %customer_id, error = %e, "Customer pipeline failed");
                    summary.customers_failed += 1;
                    summary.errors.push(CustomerRunError {
                        customer_id,
                        message: e.to_string(),
                    });
                    results.push(CustomerRunResult {
                        customer_id,
                        invoice_id: None,
                        rows: 0,
                        raw_total: Decimal::ZERO,
                        priced_total: Decimal::ZERO,
                        credit_applied: Decimal::ZERO,
                        final_total: Decimal::ZERO,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        summary.discount_total = summary.raw_total - summary.priced_total;
        summary.projects_processed = projects.len() as i32;
        summary.currency_breakdown =
            serde_json::to_value(&currency_totals).unwrap_or(serde_json::Value::Null);

        let status = if summary.customers_failed > 0 {
            InvoiceRunStatus::Failed
        } else {
            InvoiceRunStatus::Succeeded
        };

        let finished = self.runs.finish(run.run_id, status, &summary).await?;
        record_run_finished(status.as_str());

        info!(
            run_id = %run.run_id,
            status = status.as_str(),
            customers = summary.customers_processed,
            failed = summary.customers_failed,
            invoices = summary.invoices_created,
            "Invoice run finished"
        );

        Ok(RunReport {
            run: finished,
            results,
        })
    }

    async fn bill_customer(
        &self,
        run: &InvoiceRun,
        month: BillingMonth,
        stage: StagedCustomer,
        incoming: Vec<RawCostEntry>,
        groups: &crate::models::SkuGroupIndex,
        currency_totals: &mut BTreeMap<String, Decimal>,
    ) -> Result<CustomerRunResult, AppError> {
        let customer = stage.customer;
        let mut billable = stage.application.transformed;
        billable.extend(incoming);
        let rows = stage.loaded_rows;

        if billable.is_empty() {
            // Nothing left to bill, but exclusions and moves still leave an
            // audit trail.
            self.special_rules
                .record_effects(run.run_id, customer.customer_id, &stage.application.effects)
                .await?;
            return Ok(CustomerRunResult {
                customer_id: customer.customer_id,
                invoice_id: None,
                rows,
                raw_total: Decimal::ZERO,
                priced_total: Decimal::ZERO,
                credit_applied: Decimal::ZERO,
                final_total: Decimal::ZERO,
                error: None,
            });
        }

        let pricing_rules = self
            .pricing_rules
            .load_applicable(customer.customer_id, month)
            .await?;
        let outcome = self.pricer.price(billable, &pricing_rules, groups);

        let items = line_items_from(&outcome);
        let raw_subtotal: Decimal = items.iter().map(|item| item.list_amount).sum();
        let subtotal: Decimal = items.iter().map(|item| item.amount).sum();

        let invoice = self
            .invoices
            .create_with_line_items(
                NewInvoice {
                    run_id: run.run_id,
                    customer_id: customer.customer_id,
                    billing_month: month.first_day(),
                    currency: customer.currency.clone(),
                    raw_subtotal,
                    subtotal,
                },
                items,
            )
            .await?;
        record_invoice_created(&invoice.currency);
        *currency_totals
            .entry(invoice.currency.clone())
            .or_insert(Decimal::ZERO) += invoice.subtotal;

        self.special_rules
            .record_effects(run.run_id, customer.customer_id, &stage.application.effects)
            .await?;

        let credit_outcome = self
            .credits
            .apply_to_invoice(
                customer.customer_id,
                invoice.invoice_id,
                run.run_id,
                invoice.subtotal,
                &invoice.currency,
                month,
            )
            .await?;

        let invoice = if credit_outcome.total_applied > Decimal::ZERO {
            self.invoices
                .apply_credit_totals(
                    invoice.invoice_id,
                    credit_outcome.total_applied,
                    credit_outcome.final_amount,
                )
                .await?
        } else {
            invoice
        };

        Ok(CustomerRunResult {
            customer_id: customer.customer_id,
            invoice_id: Some(invoice.invoice_id),
            rows,
            raw_total: invoice.raw_subtotal,
            priced_total: invoice.subtotal,
            credit_applied: invoice.credit_applied,
            final_total: invoice.total,
            error: None,
        })
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<InvoiceRun, AppError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("invoice run {} not found", run_id)))
    }

    /// One-way invoice lock. Locking an already-locked invoice is a
    /// conflict, never a silent success.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, actor = actor))]
    pub async fn lock_invoice(&self, invoice_id: Uuid, actor: &str) -> Result<Invoice, AppError> {
        let invoice = self.invoices.lock(invoice_id, actor).await?;
        info!(invoice_id = %invoice.invoice_id, "Invoice locked");
        Ok(invoice)
    }
}

/// Aggregate priced entries into ordered line items, one per service/SKU,
/// amounts rounded to the cent so the invoice balances exactly.
fn line_items_from(outcome: &PricingOutcome) -> Vec<NewLineItem> {
    struct Agg {
        quantity: Decimal,
        amount: Decimal,
        list_amount: Decimal,
        pricing_rule_id: Option<Uuid>,
        projects: BTreeSet<String>,
        entry_count: usize,
    }

    let mut by_sku: BTreeMap<(String, String), Agg> = BTreeMap::new();
    for line in &outcome.lines {
        let key = (line.entry.service_id.clone(), line.entry.sku_id.clone());
        let agg = by_sku.entry(key).or_insert_with(|| Agg {
            quantity: Decimal::ZERO,
            amount: Decimal::ZERO,
            list_amount: Decimal::ZERO,
            pricing_rule_id: line.pricing_rule_id,
            projects: BTreeSet::new(),
            entry_count: 0,
        });
        agg.quantity += line.entry.usage_amount;
        agg.amount += line.billed_amount;
        agg.list_amount += line.list_amount;
        agg.projects.insert(line.entry.project_id.clone());
        agg.entry_count += 1;
    }

    by_sku
        .into_iter()
        .enumerate()
        .map(|(index, ((service_id, sku_id), agg))| {
            let amount = agg.amount.round_dp(2);
            let list_amount = agg.list_amount.round_dp(2);
            let unit_price = if agg.quantity > Decimal::ZERO {
                (amount / agg.quantity).round_dp(6)
            } else {
                Decimal::ZERO
            };
            NewLineItem {
                description: format!("{} / {}", service_id, sku_id),
                service_id,
                sku_id,
                quantity: agg.quantity,
                unit_price,
                amount,
                list_amount,
                pricing_rule_id: agg.pricing_rule_id,
                sort_order: index as i32,
                provenance: Some(serde_json::json!({
                    "projects": agg.projects,
                    "entry_count": agg.entry_count,
                })),
            }
        })
        .collect()
}
