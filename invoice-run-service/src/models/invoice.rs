//! Invoice and line-item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status. `Locked` is terminal: once `locked_at` is set the invoice
/// and its line items are immutable to every code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Cancelled,
    Locked,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Locked => "locked",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "issued" => InvoiceStatus::Issued,
            "paid" => InvoiceStatus::Paid,
            "cancelled" => InvoiceStatus::Cancelled,
            "locked" => InvoiceStatus::Locked,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Output of a successful per-customer pipeline pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub run_id: Uuid,
    pub customer_id: Uuid,
    pub billing_month: chrono::NaiveDate,
    pub currency: String,
    /// Pre-discount (list price) total.
    pub raw_subtotal: Decimal,
    /// Post-discount, pre-credit total.
    pub subtotal: Decimal,
    pub credit_applied: Decimal,
    /// Amount due: subtotal minus applied credits.
    pub total: Decimal,
    pub status: String,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some() || self.status() == InvoiceStatus::Locked
    }
}

/// Ordered line on an invoice, aggregated per service/SKU with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceLineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub service_id: String,
    pub sku_id: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Billed (post-discount) amount.
    pub amount: Decimal,
    /// List-price amount before discounting.
    pub list_amount: Decimal,
    pub pricing_rule_id: Option<Uuid>,
    pub sort_order: i32,
    pub provenance: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub run_id: Uuid,
    pub customer_id: Uuid,
    pub billing_month: chrono::NaiveDate,
    pub currency: String,
    pub raw_subtotal: Decimal,
    pub subtotal: Decimal,
}

/// Input for creating a line item.
#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub service_id: String,
    pub sku_id: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub list_amount: Decimal,
    pub pricing_rule_id: Option<Uuid>,
    pub sort_order: i32,
    pub provenance: Option<serde_json::Value>,
}
