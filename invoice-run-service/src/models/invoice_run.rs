//! Invoice run model: one execution attempt for a billing month.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Run status. Succeeded/Failed are terminal for execution; Locked is the
/// one-way freeze applied when an invoice of the run is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceRunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Locked,
}

impl InvoiceRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceRunStatus::Queued => "queued",
            InvoiceRunStatus::Running => "running",
            InvoiceRunStatus::Succeeded => "succeeded",
            InvoiceRunStatus::Failed => "failed",
            InvoiceRunStatus::Locked => "locked",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "running" => InvoiceRunStatus::Running,
            "succeeded" => InvoiceRunStatus::Succeeded,
            "failed" => InvoiceRunStatus::Failed,
            "locked" => InvoiceRunStatus::Locked,
            _ => InvoiceRunStatus::Queued,
        }
    }
}

/// One execution attempt for a billing month, optionally scoped to a single
/// customer. `source_key` is the deterministic idempotency hash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRun {
    pub run_id: Uuid,
    pub billing_month: chrono::NaiveDate,
    pub target_customer_id: Option<Uuid>,
    pub ingestion_batch_id: Option<Uuid>,
    pub source_key: String,
    pub status: String,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub customers_processed: i32,
    pub customers_failed: i32,
    pub invoices_created: i32,
    pub rows_processed: i64,
    pub projects_processed: i32,
    pub raw_total: Decimal,
    pub priced_total: Decimal,
    pub discount_total: Decimal,
    pub credit_total: Decimal,
    pub final_total: Decimal,
    pub currency_breakdown: Option<serde_json::Value>,
    pub errors: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl InvoiceRun {
    pub fn status(&self) -> InvoiceRunStatus {
        InvoiceRunStatus::from_string(&self.status)
    }
}

/// Result of a create-run request: the run plus whether it was an
/// idempotent match of an existing one.
#[derive(Debug, Clone, Serialize)]
pub struct RunCreation {
    pub run: InvoiceRun,
    pub idempotent: bool,
}

/// One customer's error inside a partially failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRunError {
    pub customer_id: Uuid,
    pub message: String,
}

/// Per-customer outcome of run execution.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerRunResult {
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub rows: i64,
    pub raw_total: Decimal,
    pub priced_total: Decimal,
    pub credit_applied: Decimal,
    pub final_total: Decimal,
    pub error: Option<String>,
}

/// Aggregated metadata written back to the run row, captured regardless of
/// outcome.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub customers_processed: i32,
    pub customers_failed: i32,
    pub invoices_created: i32,
    pub rows_processed: i64,
    pub projects_processed: i32,
    pub raw_total: Decimal,
    pub priced_total: Decimal,
    pub discount_total: Decimal,
    pub credit_total: Decimal,
    pub final_total: Decimal,
    pub currency_breakdown: serde_json::Value,
    pub errors: Vec<CustomerRunError>,
}

/// Full execution report returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: InvoiceRun,
    pub results: Vec<CustomerRunResult>,
}
