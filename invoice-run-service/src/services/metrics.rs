//! Metrics module for invoice-run-service.
//! Provides Prometheus metrics for run execution and monetary tracking.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "invoice_run_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoice runs finished, by terminal status
pub static RUNS_FINISHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created, by currency
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credit amount applied, by currency (monetary tracking)
pub static CREDIT_APPLIED_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Raw cost rows imported, by result
pub static IMPORTED_ROWS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice locks taken
pub static INVOICE_LOCKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    RUNS_FINISHED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "invoice_run_runs_finished_total",
                "Invoice runs finished by terminal status"
            ),
            &["status"]
        )
        .expect("Failed to register RUNS_FINISHED_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "invoice_run_invoices_created_total",
                "Invoices created by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    CREDIT_APPLIED_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "invoice_run_credit_applied_total",
                "Credit amount applied by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register CREDIT_APPLIED_TOTAL")
    });

    IMPORTED_ROWS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "invoice_run_imported_rows_total",
                "Raw cost rows imported by result"
            ),
            &["result"]
        )
        .expect("Failed to register IMPORTED_ROWS_TOTAL")
    });

    INVOICE_LOCKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("invoice_run_invoice_locks_total", "Invoice locks taken"),
            &["result"]
        )
        .expect("Failed to register INVOICE_LOCKS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "invoice_run_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a finished invoice run.
pub fn record_run_finished(status: &str) {
    if let Some(counter) = RUNS_FINISHED_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record an invoice created.
pub fn record_invoice_created(currency: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[currency]).inc();
    }
}

/// Record a credit amount applied.
pub fn record_credit_applied(currency: &str, amount: f64) {
    if let Some(counter) = CREDIT_APPLIED_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}

/// Record imported rows.
pub fn record_imported_rows(result: &str, count: u64) {
    if let Some(counter) = IMPORTED_ROWS_TOTAL.get() {
        counter.with_label_values(&[result]).inc_by(count);
    }
}

/// Record an invoice lock attempt.
pub fn record_invoice_lock(result: &str) {
    if let Some(counter) = INVOICE_LOCKS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
