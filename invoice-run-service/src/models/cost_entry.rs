//! Raw usage-cost facts and their import batches.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// An immutable usage-cost fact. Owned by an ingestion batch; never mutated
/// after import.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RawCostEntry {
    pub entry_id: Uuid,
    pub batch_id: Uuid,
    pub billing_account_id: String,
    pub project_id: String,
    pub service_id: String,
    pub sku_id: String,
    pub usage_start: DateTime<Utc>,
    pub usage_end: DateTime<Utc>,
    pub usage_amount: Decimal,
    pub cost: Decimal,
    pub currency: String,
    pub region: Option<String>,
    pub checksum: String,
    pub created_utc: DateTime<Utc>,
}

/// One ingestion batch of raw cost rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CostImportBatch {
    pub batch_id: Uuid,
    pub billing_month: chrono::NaiveDate,
    pub source: String,
    pub row_count: i32,
    pub duplicate_count: i32,
    pub created_utc: DateTime<Utc>,
}

/// Incoming raw cost row at the import boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImportCostRow {
    #[validate(length(min = 1))]
    pub billing_account_id: String,
    #[validate(length(min = 1))]
    pub project_id: String,
    #[validate(length(min = 1))]
    pub service_id: String,
    #[validate(length(min = 1))]
    pub sku_id: String,
    pub usage_start_time: DateTime<Utc>,
    pub usage_end_time: DateTime<Utc>,
    pub usage_amount: Decimal,
    pub cost: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    pub region: Option<String>,
}

impl ImportCostRow {
    /// Content checksum used for idempotent import: duplicate rows within
    /// the same month and source are recognized and skipped.
    pub fn checksum(&self, month: &str, source: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.billing_account_id.as_str(),
            self.project_id.as_str(),
            self.service_id.as_str(),
            self.sku_id.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.usage_start_time.to_rfc3339().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.usage_end_time.to_rfc3339().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.usage_amount.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.cost.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.currency.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.region.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(month.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hex::encode(hasher.finalize())
    }
}
