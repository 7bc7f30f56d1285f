//! Customer model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A billable customer. One customer owns exactly one cloud billing account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub name: String,
    pub billing_account_id: String,
    pub currency: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}
