//! Invoice run orchestrator tests: idempotent creation, pipeline execution
//! and partial-failure semantics, against in-memory stores.

mod common;

use common::{
    credit, customer, date, dec, entry, month, orchestrator, pricing_rule, special_rule,
    InMemoryStore,
};
use invoice_run_service::models::{InvoiceRunStatus, SpecialRuleKind};
use invoice_run_service::services::{source_key, CreateRun};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

fn create_request(m: &str) -> CreateRun {
    CreateRun {
        month: month(m),
        target_customer_id: None,
        ingestion_batch_id: None,
    }
}

#[test]
fn source_key_is_deterministic_over_month_and_selector() {
    let batch = Uuid::new_v4();

    assert_eq!(
        source_key(month("2024-01"), None),
        source_key(month("2024-01"), None)
    );
    assert_eq!(
        source_key(month("2024-01"), Some(batch)),
        source_key(month("2024-01"), Some(batch))
    );
    assert_ne!(
        source_key(month("2024-01"), None),
        source_key(month("2024-02"), None)
    );
    assert_ne!(
        source_key(month("2024-01"), None),
        source_key(month("2024-01"), Some(batch))
    );
}

#[tokio::test]
async fn run_creation_is_idempotent_for_the_same_source() {
    let store = InMemoryStore::new();
    let orch = orchestrator(&store);

    let first = orch.create_run(create_request("2024-01")).await.unwrap();
    assert!(!first.idempotent);

    let second = orch.create_run(create_request("2024-01")).await.unwrap();
    assert!(second.idempotent);
    assert_eq!(first.run.run_id, second.run.run_id);
    assert_eq!(store.runs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn a_different_source_while_a_run_is_in_flight_is_a_conflict() {
    let store = InMemoryStore::new();
    let orch = orchestrator(&store);

    orch.create_run(create_request("2024-01")).await.unwrap();

    let conflicting = orch
        .create_run(CreateRun {
            month: month("2024-01"),
            target_customer_id: None,
            ingestion_batch_id: Some(Uuid::new_v4()),
        })
        .await;

    let err = conflicting.expect_err("second source must conflict");
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(err.to_string().contains("in progress"));
}

#[tokio::test]
async fn executing_a_run_pipelines_rules_pricing_and_credits() {
    let m = month("2024-01");
    let store = InMemoryStore::new();

    let customer_a = customer("Acme", "acct-a");
    let customer_b = customer("Bolt", "acct-b");
    store.add_customer(customer_a.clone());
    store.add_customer(customer_b.clone());

    // Customer A: one excluded SKU, one discounted SKU, one SKU moved to B.
    store.add_entry(entry("acct-a", "proj-1", "compute", "sku-excluded", "10.00", m));
    store.add_entry(entry("acct-a", "proj-1", "compute", "sku-normal", "100.00", m));
    store.add_entry(entry("acct-a", "proj-2", "storage", "sku-moved", "20.00", m));

    let mut exclude = special_rule(SpecialRuleKind::ExcludeSku, 1, m);
    exclude.customer_id = Some(customer_a.customer_id);
    exclude.match_sku_id = Some("sku-excluded".to_string());
    store.add_special_rule(exclude);

    let mut move_rule = special_rule(SpecialRuleKind::MoveToCustomer, 2, m);
    move_rule.customer_id = Some(customer_a.customer_id);
    move_rule.match_sku_id = Some("sku-moved".to_string());
    move_rule.target_customer_id = Some(customer_b.customer_id);
    store.add_special_rule(move_rule);

    let group_id = Uuid::new_v4();
    store.add_sku_member(group_id, "sku-normal");
    store.add_pricing_rule(
        customer_a.customer_id,
        pricing_rule(Some(group_id), "0.90", 1, m),
    );

    store.add_credit(credit(
        customer_a.customer_id,
        "30.00",
        date("2024-01-01"),
        date("2024-06-30"),
        true,
    ));

    let orch = orchestrator(&store);
    let creation = orch.create_run(create_request("2024-01")).await.unwrap();
    let report = orch.execute_run(creation.run.run_id).await.unwrap();

    assert_eq!(report.run.status(), InvoiceRunStatus::Succeeded);
    assert_eq!(report.run.customers_processed, 2);
    assert_eq!(report.run.invoices_created, 2);
    assert_eq!(report.run.rows_processed, 3);

    // Customer A: 100 list, discounted to 90, minus 30 credit.
    let result_a = report
        .results
        .iter()
        .find(|r| r.customer_id == customer_a.customer_id)
        .unwrap();
    let invoice_a = store.invoice(result_a.invoice_id.unwrap());
    assert_eq!(invoice_a.raw_subtotal, dec("100.00"));
    assert_eq!(invoice_a.subtotal, dec("90.00"));
    assert_eq!(invoice_a.credit_applied, dec("30.00"));
    assert_eq!(invoice_a.total, dec("60.00"));

    // Customer B: only the moved entry, at list price.
    let result_b = report
        .results
        .iter()
        .find(|r| r.customer_id == customer_b.customer_id)
        .unwrap();
    let invoice_b = store.invoice(result_b.invoice_id.unwrap());
    assert_eq!(invoice_b.subtotal, dec("20.00"));
    assert_eq!(invoice_b.total, dec("20.00"));

    // Run-level money balances: list 120, priced 110, discount 10,
    // credits 30, final 80.
    assert_eq!(report.run.raw_total, dec("120.00"));
    assert_eq!(report.run.priced_total, dec("110.00"));
    assert_eq!(report.run.discount_total, dec("10.00"));
    assert_eq!(report.run.credit_total, dec("30.00"));
    assert_eq!(report.run.final_total, dec("80.00"));

    // Rule effects were recorded for the customer's two matched rules.
    assert_eq!(store.rule_effects.lock().unwrap().len(), 2);

    // Line items carry the discount transparently.
    let items = store.items_for_invoice(invoice_a.invoice_id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].list_amount, dec("100.00"));
    assert_eq!(items[0].amount, dec("90.00"));
}

#[tokio::test]
async fn scoped_run_only_bills_the_target_customer() {
    let m = month("2024-01");
    let store = InMemoryStore::new();

    let target = customer("Target", "acct-t");
    let other = customer("Other", "acct-o");
    store.add_customer(target.clone());
    store.add_customer(other.clone());
    store.add_entry(entry("acct-t", "proj-1", "compute", "sku-a", "50.00", m));
    store.add_entry(entry("acct-o", "proj-9", "compute", "sku-b", "70.00", m));

    let orch = orchestrator(&store);
    let creation = orch
        .create_run(CreateRun {
            month: m,
            target_customer_id: Some(target.customer_id),
            ingestion_batch_id: None,
        })
        .await
        .unwrap();
    let report = orch.execute_run(creation.run.run_id).await.unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].customer_id, target.customer_id);
    assert_eq!(store.invoices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn customers_without_billable_rows_get_no_invoice() {
    let m = month("2024-01");
    let store = InMemoryStore::new();
    store.add_customer(customer("Empty", "acct-empty"));

    let orch = orchestrator(&store);
    let creation = orch.create_run(create_request("2024-01")).await.unwrap();
    let report = orch.execute_run(creation.run.run_id).await.unwrap();

    assert_eq!(report.run.status(), InvoiceRunStatus::Succeeded);
    assert_eq!(report.run.customers_processed, 1);
    assert_eq!(report.run.invoices_created, 0);
    assert!(report.results[0].invoice_id.is_none());
}

#[tokio::test]
async fn one_failing_customer_marks_the_run_failed_but_keeps_other_invoices() {
    let m = month("2024-01");
    let store = InMemoryStore::new();

    let healthy = customer("Healthy", "acct-h");
    let failing = customer("Failing", "acct-f");
    store.add_customer(healthy.clone());
    store.add_customer(failing.clone());
    store.add_entry(entry("acct-h", "proj-1", "compute", "sku-a", "40.00", m));
    store.add_entry(entry("acct-f", "proj-2", "compute", "sku-b", "60.00", m));
    *store.fail_pricing_for.lock().unwrap() = Some(failing.customer_id);

    let orch = orchestrator(&store);
    let creation = orch.create_run(create_request("2024-01")).await.unwrap();
    let report = orch.execute_run(creation.run.run_id).await.unwrap();

    assert_eq!(report.run.status(), InvoiceRunStatus::Failed);
    assert_eq!(report.run.customers_failed, 1);

    // The healthy customer's invoice was committed and stays committed.
    let healthy_result = report
        .results
        .iter()
        .find(|r| r.customer_id == healthy.customer_id)
        .unwrap();
    assert!(healthy_result.invoice_id.is_some());
    assert_eq!(store.invoices.lock().unwrap().len(), 1);

    // The failing customer is reported in the error list.
    let failing_result = report
        .results
        .iter()
        .find(|r| r.customer_id == failing.customer_id)
        .unwrap();
    assert!(failing_result.error.is_some());
    let errors = report.run.errors.clone().unwrap();
    assert_eq!(errors.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn a_finished_run_cannot_be_executed_again() {
    let m = month("2024-01");
    let store = InMemoryStore::new();
    store.add_customer(customer("Acme", "acct-a"));
    store.add_entry(entry("acct-a", "proj-1", "compute", "sku-a", "10.00", m));

    let orch = orchestrator(&store);
    let creation = orch.create_run(create_request("2024-01")).await.unwrap();
    orch.execute_run(creation.run.run_id).await.unwrap();

    let again = orch.execute_run(creation.run.run_id).await;
    let err = again.expect_err("re-execution must conflict");
    assert!(matches!(err, AppError::Conflict(_)));

    // Status never went back from succeeded.
    assert_eq!(
        store.run(creation.run.run_id).status(),
        InvoiceRunStatus::Succeeded
    );
}

#[tokio::test]
async fn executing_an_unknown_run_is_not_found() {
    let store = InMemoryStore::new();
    let orch = orchestrator(&store);

    let err = orch
        .execute_run(Uuid::new_v4())
        .await
        .expect_err("unknown run");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn credits_beyond_the_invoice_amount_are_left_unconsumed() {
    let m = month("2024-01");
    let store = InMemoryStore::new();

    let cust = customer("Acme", "acct-a");
    store.add_customer(cust.clone());
    store.add_entry(entry("acct-a", "proj-1", "compute", "sku-a", "25.00", m));

    let big_credit = credit(
        cust.customer_id,
        "100.00",
        date("2024-01-01"),
        date("2024-06-30"),
        true,
    );
    store.add_credit(big_credit.clone());

    let orch = orchestrator(&store);
    let creation = orch.create_run(create_request("2024-01")).await.unwrap();
    let report = orch.execute_run(creation.run.run_id).await.unwrap();

    let invoice = store.invoice(report.results[0].invoice_id.unwrap());
    assert_eq!(invoice.credit_applied, dec("25.00"));
    assert_eq!(invoice.total, Decimal::ZERO);
    assert_eq!(
        store.credit(big_credit.credit_id).remaining_amount,
        dec("75.00")
    );
}
