//! Repository traits, one per entity. The engines and the orchestrator are
//! written against these so they can be exercised without a live database;
//! [`super::Database`] is the Postgres implementation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    BillingMonth, Credit, CreditLedgerEntry, Customer, Invoice, InvoiceRun, InvoiceRunStatus,
    NewInvoice, NewLineItem, PricingRule, RawCostEntry, RuleEffect, RunSummary, SkuGroupIndex,
    SpecialRule,
};

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn list_active(&self) -> Result<Vec<Customer>, AppError>;

    async fn get(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError>;
}

#[async_trait]
pub trait CostStore: Send + Sync {
    /// Raw cost entries for one billing account and month, optionally
    /// restricted to a single ingestion batch.
    async fn load_entries(
        &self,
        billing_account_id: &str,
        month: BillingMonth,
        batch_id: Option<Uuid>,
    ) -> Result<Vec<RawCostEntry>, AppError>;
}

#[async_trait]
pub trait SkuGroupStore: Send + Sync {
    async fn load_index(&self) -> Result<SkuGroupIndex, AppError>;
}

#[async_trait]
pub trait SpecialRuleStore: Send + Sync {
    /// Enabled rules (customer-specific plus global) whose effective window
    /// overlaps the month, sorted by priority ascending.
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<SpecialRule>, AppError>;

    /// Append the per-rule audit aggregates for one customer in one run.
    async fn record_effects(
        &self,
        run_id: Uuid,
        customer_id: Uuid,
        effects: &[RuleEffect],
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    /// Pricing rules from the customer's lists whose effective window
    /// overlaps the month.
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<PricingRule>, AppError>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Eligible credits for the month: active, remaining > 0, window
    /// overlaps, carry-over restriction honored. Ordered `valid_from`
    /// ascending (oldest-first consumption).
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Credit>, AppError>;

    /// Apply up to `requested` from one credit inside a single transaction:
    /// re-read the row under a write lock, clamp against the live remaining
    /// amount, insert the ledger entry, decrement, flip to depleted at zero.
    /// Returns `None` when nothing could be applied (raced to zero or
    /// no longer active).
    async fn apply_credit(
        &self,
        credit_id: Uuid,
        invoice_id: Uuid,
        run_id: Uuid,
        requested: Decimal,
    ) -> Result<Option<CreditLedgerEntry>, AppError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert the invoice and all of its line items in one transaction.
    async fn create_with_line_items(
        &self,
        invoice: NewInvoice,
        items: Vec<NewLineItem>,
    ) -> Result<Invoice, AppError>;

    /// Write the post-credit totals. Refused with a conflict if the invoice
    /// was locked in the meantime.
    async fn apply_credit_totals(
        &self,
        invoice_id: Uuid,
        credit_applied: Decimal,
        total: Decimal,
    ) -> Result<Invoice, AppError>;

    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// One-way lock: re-read under a write lock, conflict if already
    /// locked, otherwise set status/locked_at/locked_by and freeze the
    /// owning run.
    async fn lock(&self, invoice_id: Uuid, actor: &str) -> Result<Invoice, AppError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn find_by_key(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<Option<InvoiceRun>, AppError>;

    async fn find_locked(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError>;

    async fn find_in_flight(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError>;

    async fn insert_queued(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        ingestion_batch_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<InvoiceRun, AppError>;

    async fn get(&self, run_id: Uuid) -> Result<Option<InvoiceRun>, AppError>;

    /// Guarded queued -> running transition. Returns false when the run was
    /// not in the queued state (another executor won the race).
    async fn begin_execution(&self, run_id: Uuid) -> Result<bool, AppError>;

    /// Terminal transition with result metadata. Only a running run may be
    /// finished.
    async fn finish(
        &self,
        run_id: Uuid,
        status: InvoiceRunStatus,
        summary: &RunSummary,
    ) -> Result<InvoiceRun, AppError>;
}
