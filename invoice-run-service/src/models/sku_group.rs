//! SKU grouping used by special-rule matching and pricing-rule scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A named group of catalog SKUs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkuGroup {
    pub group_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

/// Membership row of the many-to-many SKU/group relation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkuGroupMember {
    pub group_id: Uuid,
    pub sku_id: String,
}

/// In-memory index of SKU-group membership, built once per run.
#[derive(Debug, Clone, Default)]
pub struct SkuGroupIndex {
    groups_by_sku: HashMap<String, HashSet<Uuid>>,
}

impl SkuGroupIndex {
    pub fn from_members(members: impl IntoIterator<Item = SkuGroupMember>) -> Self {
        let mut groups_by_sku: HashMap<String, HashSet<Uuid>> = HashMap::new();
        for member in members {
            groups_by_sku
                .entry(member.sku_id)
                .or_default()
                .insert(member.group_id);
        }
        Self { groups_by_sku }
    }

    /// Whether `sku_id` belongs to `group_id`.
    pub fn contains(&self, sku_id: &str, group_id: Uuid) -> bool {
        self.groups_by_sku
            .get(sku_id)
            .map(|groups| groups.contains(&group_id))
            .unwrap_or(false)
    }
}
