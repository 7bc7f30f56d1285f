//! Database service for invoice-run-service.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    BillingMonth, CostImportBatch, Credit, CreditLedgerEntry, CreditStatus, Customer,
    ImportCostRow, Invoice, InvoiceRun, InvoiceRunStatus, InvoiceStatus, NewInvoice, NewLineItem,
    PricingRule, RawCostEntry, RuleEffect, RunSummary, SkuGroupIndex, SkuGroupMember, SpecialRule,
};
use crate::services::metrics::{record_credit_applied, record_invoice_lock, DB_QUERY_DURATION};
use crate::services::stores::{
    CostStore, CreditStore, CustomerStore, InvoiceStore, PricingStore, RunStore, SkuGroupStore,
    SpecialRuleStore,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "invoice-run-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Raw Cost Import
    // =========================================================================

    /// Import a batch of raw cost rows. Rows whose content checksum was
    /// already imported for this month and source are skipped, making the
    /// import idempotent.
    #[instrument(skip(self, rows), fields(month = %month, source = source, rows = rows.len()))]
    pub async fn import_costs(
        &self,
        month: BillingMonth,
        source: &str,
        rows: Vec<ImportCostRow>,
    ) -> Result<CostImportBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["import_costs"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let batch_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO cost_import_batches (batch_id, billing_month, source)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(batch_id)
        .bind(month.first_day())
        .bind(source)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create batch: {}", e)))?;

        let month_key = month.to_string();
        let mut inserted: i32 = 0;
        let mut duplicates: i32 = 0;

        for row in &rows {
            let checksum = row.checksum(&month_key, source);
            let result = sqlx::query(
                r#"
                INSERT INTO raw_cost_entries (
                    entry_id, batch_id, billing_account_id, project_id, service_id, sku_id,
                    usage_start, usage_end, usage_amount, cost, currency, region, checksum
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (checksum) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(batch_id)
            .bind(&row.billing_account_id)
            .bind(&row.project_id)
            .bind(&row.service_id)
            .bind(&row.sku_id)
            .bind(row.usage_start_time)
            .bind(row.usage_end_time)
            .bind(row.usage_amount)
            .bind(row.cost)
            .bind(&row.currency)
            .bind(&row.region)
            .bind(checksum)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert cost row: {}", e))
            })?;

            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                duplicates += 1;
            }
        }

        let batch = sqlx::query_as::<_, CostImportBatch>(
            r#"
            UPDATE cost_import_batches
            SET row_count = $2, duplicate_count = $3
            WHERE batch_id = $1
            RETURNING batch_id, billing_month, source, row_count, duplicate_count, created_utc
            "#,
        )
        .bind(batch_id)
        .bind(inserted)
        .bind(duplicates)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to finalize batch: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            batch_id = %batch.batch_id,
            inserted = inserted,
            duplicates = duplicates,
            "Raw cost batch imported"
        );

        Ok(batch)
    }
}

// =============================================================================
// Store implementations
// =============================================================================

#[async_trait]
impl CustomerStore for Database {
    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_customers"])
            .start_timer();

        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, name, billing_account_id, currency, is_active, created_utc
            FROM customers
            WHERE is_active = TRUE
            ORDER BY customer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list customers: {}", e)))?;

        timer.observe_duration();

        Ok(customers)
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn get(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, name, billing_account_id, currency, is_active, created_utc
            FROM customers
            WHERE customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();

        Ok(customer)
    }
}

#[async_trait]
impl CostStore for Database {
    #[instrument(skip(self), fields(billing_account_id = billing_account_id, month = %month))]
    async fn load_entries(
        &self,
        billing_account_id: &str,
        month: BillingMonth,
        batch_id: Option<Uuid>,
    ) -> Result<Vec<RawCostEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_cost_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, RawCostEntry>(
            r#"
            SELECT entry_id, batch_id, billing_account_id, project_id, service_id, sku_id,
                usage_start, usage_end, usage_amount, cost, currency, region, checksum, created_utc
            FROM raw_cost_entries
            WHERE billing_account_id = $1
              AND usage_start >= $2
              AND usage_start < $3
              AND ($4::uuid IS NULL OR batch_id = $4)
            ORDER BY usage_start, entry_id
            "#,
        )
        .bind(billing_account_id)
        .bind(month.start_instant())
        .bind(month.end_instant())
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load cost entries: {}", e))
        })?;

        timer.observe_duration();

        Ok(entries)
    }
}

#[async_trait]
impl SkuGroupStore for Database {
    #[instrument(skip(self))]
    async fn load_index(&self) -> Result<SkuGroupIndex, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_sku_group_index"])
            .start_timer();

        let members = sqlx::query_as::<_, SkuGroupMember>(
            r#"
            SELECT group_id, sku_id
            FROM sku_group_members
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load sku group members: {}", e))
        })?;

        timer.observe_duration();

        Ok(SkuGroupIndex::from_members(members))
    }
}

#[async_trait]
impl SpecialRuleStore for Database {
    #[instrument(skip(self), fields(customer_id = %customer_id, month = %month))]
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<SpecialRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_special_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, SpecialRule>(
            r#"
            SELECT rule_id, customer_id, name, kind, priority, match_sku_id, match_sku_group_id,
                match_service_id, match_project_id, match_billing_account_id, cost_multiplier,
                target_customer_id, effective_from, effective_to, lifecycle, created_utc
            FROM special_rules
            WHERE (customer_id = $1 OR customer_id IS NULL)
              AND lifecycle = 'active'
              AND effective_from <= $3
              AND (effective_to IS NULL OR effective_to >= $2)
            ORDER BY priority, created_utc
            "#,
        )
        .bind(customer_id)
        .bind(month.first_day())
        .bind(month.last_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load special rules: {}", e))
        })?;

        timer.observe_duration();

        Ok(rules)
    }

    #[instrument(skip(self, effects), fields(run_id = %run_id, customer_id = %customer_id, rules = effects.len()))]
    async fn record_effects(
        &self,
        run_id: Uuid,
        customer_id: Uuid,
        effects: &[RuleEffect],
    ) -> Result<(), AppError> {
        if effects.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_rule_effects"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for effect in effects {
            let breakdown = serde_json::json!({
                "by_project": effect.delta_by_project,
                "by_sku": effect.delta_by_sku,
            });

            sqlx::query(
                r#"
                INSERT INTO rule_effect_ledger (
                    ledger_id, run_id, customer_id, rule_id, matched_rows, cost_delta, breakdown
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(customer_id)
            .bind(effect.rule_id)
            .bind(effect.matched_rows)
            .bind(effect.cost_delta)
            .bind(breakdown)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record rule effect: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }
}

#[async_trait]
impl PricingStore for Database {
    #[instrument(skip(self), fields(customer_id = %customer_id, month = %month))]
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<PricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_pricing_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, PricingRule>(
            r#"
            SELECT pr.rule_id, pr.list_id, pr.sku_group_id, pr.discount_rate, pr.priority,
                pr.effective_from, pr.effective_to, pr.created_utc
            FROM pricing_rules pr
            JOIN pricing_lists pl ON pr.list_id = pl.list_id
            WHERE pl.customer_id = $1
              AND pr.effective_from <= $3
              AND (pr.effective_to IS NULL OR pr.effective_to >= $2)
            ORDER BY pr.priority, pr.created_utc DESC
            "#,
        )
        .bind(customer_id)
        .bind(month.first_day())
        .bind(month.last_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load pricing rules: {}", e))
        })?;

        timer.observe_duration();

        Ok(rules)
    }
}

#[async_trait]
impl CreditStore for Database {
    #[instrument(skip(self), fields(customer_id = %customer_id, month = %month))]
    async fn load_applicable(
        &self,
        customer_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Credit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_credits"])
            .start_timer();

        // Mirrors services::credits::eligible_credits: a non-carry-over
        // credit is only usable in the month its validity started in.
        let credits = sqlx::query_as::<_, Credit>(
            r#"
            SELECT credit_id, customer_id, kind, description, total_amount, remaining_amount,
                currency, valid_from, valid_to, allow_carry_over, status, created_utc, updated_utc
            FROM credits
            WHERE customer_id = $1
              AND status = 'active'
              AND remaining_amount > 0
              AND valid_from <= $3
              AND valid_to >= $2
              AND (allow_carry_over = TRUE OR valid_from >= $2)
            ORDER BY valid_from, created_utc
            "#,
        )
        .bind(customer_id)
        .bind(month.first_day())
        .bind(month.last_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load credits: {}", e)))?;

        timer.observe_duration();

        Ok(credits)
    }

    #[instrument(skip(self), fields(credit_id = %credit_id, invoice_id = %invoice_id, requested = %requested))]
    async fn apply_credit(
        &self,
        credit_id: Uuid,
        invoice_id: Uuid,
        run_id: Uuid,
        requested: Decimal,
    ) -> Result<Option<CreditLedgerEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_credit"])
            .start_timer();

        if requested <= Decimal::ZERO {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Read-for-update serializes concurrent applications of the same
        // credit; the applied amount is clamped against the live balance.
        let credit = sqlx::query_as::<_, Credit>(
            r#"
            SELECT credit_id, customer_id, kind, description, total_amount, remaining_amount,
                currency, valid_from, valid_to, allow_carry_over, status, created_utc, updated_utc
            FROM credits
            WHERE credit_id = $1
            FOR UPDATE
            "#,
        )
        .bind(credit_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to read credit for update: {}", e))
        })?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Credit {} not found", credit_id)))?;

        if credit.status() != CreditStatus::Active || credit.remaining_amount <= Decimal::ZERO {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        let applied = requested.min(credit.remaining_amount);
        let remaining_after = credit.remaining_amount - applied;

        let entry = sqlx::query_as::<_, CreditLedgerEntry>(
            r#"
            INSERT INTO credit_ledger (
                ledger_id, credit_id, invoice_id, run_id, applied_amount, remaining_before
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING ledger_id, credit_id, invoice_id, run_id, applied_amount, remaining_before, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(credit_id)
        .bind(invoice_id)
        .bind(run_id)
        .bind(applied)
        .bind(credit.remaining_amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert credit ledger: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE credits
            SET remaining_amount = $2,
                status = CASE WHEN $2 = 0 THEN 'depleted' ELSE status END,
                updated_utc = NOW()
            WHERE credit_id = $1
            "#,
        )
        .bind(credit_id)
        .bind(remaining_after)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update credit: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        record_credit_applied(&credit.currency, applied.to_f64().unwrap_or(0.0));

        info!(
            credit_id = %credit_id,
            applied = %applied,
            remaining = %remaining_after,
            "Credit applied"
        );

        Ok(Some(entry))
    }
}

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self, invoice, items), fields(run_id = %invoice.run_id, customer_id = %invoice.customer_id, items = items.len()))]
    async fn create_with_line_items(
        &self,
        invoice: NewInvoice,
        items: Vec<NewLineItem>,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_id = Uuid::new_v4();
        let created = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                invoice_id, run_id, customer_id, billing_month, currency,
                raw_subtotal, subtotal, credit_applied, total, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $7, 'draft')
            RETURNING invoice_id, run_id, customer_id, billing_month, currency, raw_subtotal,
                subtotal, credit_applied, total, status, locked_at, locked_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(invoice.run_id)
        .bind(invoice.customer_id)
        .bind(invoice.billing_month)
        .bind(&invoice.currency)
        .bind(invoice.raw_subtotal)
        .bind(invoice.subtotal)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (
                    line_item_id, invoice_id, service_id, sku_id, description, quantity,
                    unit_price, amount, list_amount, pricing_rule_id, sort_order, provenance
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice_id)
            .bind(&item.service_id)
            .bind(&item.sku_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.amount)
            .bind(item.list_amount)
            .bind(item.pricing_rule_id)
            .bind(item.sort_order)
            .bind(&item.provenance)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert line item: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %created.invoice_id,
            subtotal = %created.subtotal,
            line_items = items.len(),
            "Invoice created"
        );

        Ok(created)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn apply_credit_totals(
        &self,
        invoice_id: Uuid,
        credit_applied: Decimal,
        total: Decimal,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_credit_totals"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET credit_applied = $2, total = $3, updated_utc = NOW()
            WHERE invoice_id = $1 AND status = 'draft' AND locked_at IS NULL
            RETURNING invoice_id, run_id, customer_id, billing_month, currency, raw_subtotal,
                subtotal, credit_applied, total, status, locked_at, locked_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(credit_applied)
        .bind(total)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice totals: {}", e))
        })?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => Ok(invoice),
            None => match InvoiceStore::get(self, invoice_id).await? {
                Some(_) => Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} is locked or no longer draft",
                    invoice_id
                ))),
                None => Err(AppError::NotFound(anyhow::anyhow!(
                    "Invoice {} not found",
                    invoice_id
                ))),
            },
        }
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, run_id, customer_id, billing_month, currency, raw_subtotal,
                subtotal, credit_applied, total, status, locked_at, locked_by, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, actor = actor))]
    async fn lock(&self, invoice_id: Uuid, actor: &str) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Re-read under a write lock so two racing lock requests cannot
        // both believe they performed the transition.
        let existing = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, run_id, customer_id, billing_month, currency, raw_subtotal,
                subtotal, credit_applied, total, status, locked_at, locked_by, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to read invoice for update: {}", e))
        })?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        if existing.is_locked() {
            tx.rollback().await.ok();
            timer.observe_duration();
            record_invoice_lock("conflict");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is already locked",
                invoice_id
            )));
        }

        let locked = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2, locked_at = NOW(), locked_by = $3, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, run_id, customer_id, billing_month, currency, raw_subtotal,
                subtotal, credit_applied, total, status, locked_at, locked_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Locked.as_str())
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        // Locking an invoice freezes its run (and with it the billing
        // month) against further run creation. One-way.
        sqlx::query(
            r#"
            UPDATE invoice_runs
            SET status = $2, updated_utc = NOW()
            WHERE run_id = $1 AND status <> $2
            "#,
        )
        .bind(existing.run_id)
        .bind(InvoiceRunStatus::Locked.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock run: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        record_invoice_lock("locked");

        Ok(locked)
    }
}

#[async_trait]
impl RunStore for Database {
    #[instrument(skip(self), fields(month = %month, source_key = source_key))]
    async fn find_by_key(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<Option<InvoiceRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_run_by_key"])
            .start_timer();

        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            SELECT run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            FROM invoice_runs
            WHERE billing_month = $1
              AND target_customer_id IS NOT DISTINCT FROM $2
              AND source_key = $3
            "#,
        )
        .bind(month.first_day())
        .bind(target_customer_id)
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(month = %month))]
    async fn find_locked(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_locked_run"])
            .start_timer();

        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            SELECT run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            FROM invoice_runs
            WHERE billing_month = $1 AND status = 'locked'
            LIMIT 1
            "#,
        )
        .bind(month.first_day())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find locked run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(month = %month))]
    async fn find_in_flight(&self, month: BillingMonth) -> Result<Option<InvoiceRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_in_flight_run"])
            .start_timer();

        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            SELECT run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            FROM invoice_runs
            WHERE billing_month = $1 AND status IN ('queued', 'running')
            LIMIT 1
            "#,
        )
        .bind(month.first_day())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find in-flight run: {}", e))
        })?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(month = %month, source_key = source_key))]
    async fn insert_queued(
        &self,
        month: BillingMonth,
        target_customer_id: Option<Uuid>,
        ingestion_batch_id: Option<Uuid>,
        source_key: &str,
    ) -> Result<InvoiceRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_queued_run"])
            .start_timer();

        let run_id = Uuid::new_v4();
        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            INSERT INTO invoice_runs (
                run_id, billing_month, target_customer_id, ingestion_batch_id, source_key
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            "#,
        )
        .bind(run_id)
        .bind(month.first_day())
        .bind(target_customer_id)
        .bind(ingestion_batch_id)
        .bind(source_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                // A concurrent create won the race for this month.
                AppError::Conflict(anyhow::anyhow!(
                    "A run already exists for billing month {}",
                    month
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert run: {}", e)),
        })?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get(&self, run_id: Uuid) -> Result<Option<InvoiceRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run"])
            .start_timer();

        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            SELECT run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            FROM invoice_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn begin_execution(&self, run_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_run_execution"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoice_runs
            SET status = 'running', started_utc = NOW(), updated_utc = NOW()
            WHERE run_id = $1 AND status = 'queued'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to start run: {}", e)))?;

        timer.observe_duration();

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, summary), fields(run_id = %run_id, status = status.as_str()))]
    async fn finish(
        &self,
        run_id: Uuid,
        status: InvoiceRunStatus,
        summary: &RunSummary,
    ) -> Result<InvoiceRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_run"])
            .start_timer();

        let errors =
            serde_json::to_value(&summary.errors).unwrap_or(serde_json::Value::Null);

        let run = sqlx::query_as::<_, InvoiceRun>(
            r#"
            UPDATE invoice_runs
            SET status = $2, completed_utc = NOW(), customers_processed = $3,
                customers_failed = $4, invoices_created = $5, rows_processed = $6,
                projects_processed = $7, raw_total = $8, priced_total = $9,
                discount_total = $10, credit_total = $11, final_total = $12,
                currency_breakdown = $13, errors = $14, updated_utc = NOW()
            WHERE run_id = $1 AND status = 'running'
            RETURNING run_id, billing_month, target_customer_id, ingestion_batch_id, source_key,
                status, started_utc, completed_utc, customers_processed, customers_failed,
                invoices_created, rows_processed, projects_processed, raw_total, priced_total,
                discount_total, credit_total, final_total, currency_breakdown, errors,
                created_utc, updated_utc
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(summary.customers_processed)
        .bind(summary.customers_failed)
        .bind(summary.invoices_created)
        .bind(summary.rows_processed)
        .bind(summary.projects_processed)
        .bind(summary.raw_total)
        .bind(summary.priced_total)
        .bind(summary.discount_total)
        .bind(summary.credit_total)
        .bind(summary.final_total)
        .bind(&summary.currency_breakdown)
        .bind(errors)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to finish run: {}", e)))?;

        timer.observe_duration();

        run.ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "Run {} is no longer running and cannot be finished",
                run_id
            ))
        })
    }
}
