//! Invoice run service: computes monthly customer invoices from raw
//! cloud-usage cost records through a special-rules / pricing / credits
//! pipeline, tracked by idempotent, lockable invoice runs.

pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod startup;
