//! Domain models for invoice-run-service.

mod cost_entry;
mod credit;
mod customer;
mod invoice;
mod invoice_run;
mod month;
mod pricing;
mod sku_group;
mod special_rule;

pub use cost_entry::{CostImportBatch, ImportCostRow, RawCostEntry};
pub use credit::{Credit, CreditKind, CreditLedgerEntry, CreditOutcome, CreditStatus};
pub use customer::Customer;
pub use invoice::{Invoice, InvoiceLineItem, InvoiceStatus, NewInvoice, NewLineItem};
pub use invoice_run::{
    CustomerRunError, CustomerRunResult, InvoiceRun, InvoiceRunStatus, RunCreation, RunReport,
    RunSummary,
};
pub use month::{BillingMonth, BillingMonthParseError};
pub use pricing::{PricedEntry, PricingList, PricingOutcome, PricingRule};
pub use sku_group::{SkuGroup, SkuGroupIndex, SkuGroupMember};
pub use special_rule::{RuleEffect, RuleEffectLedgerEntry, RuleMatch, SpecialRule, SpecialRuleKind};
