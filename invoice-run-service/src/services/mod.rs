//! Services module for invoice-run-service.

pub mod credits;
pub mod database;
pub mod metrics;
pub mod pricing;
pub mod run;
pub mod special_rules;
pub mod stores;

pub use credits::{eligible_credits, CreditsEngine};
pub use database::Database;
pub use metrics::{
    get_metrics, init_metrics, record_credit_applied, record_error, record_imported_rows,
    record_invoice_created, record_invoice_lock, record_run_finished,
};
pub use pricing::{DiscountPricing, PricingEngine};
pub use run::{source_key, CreateRun, RunOrchestrator};
pub use special_rules::{apply_special_rules, RuleApplication};
