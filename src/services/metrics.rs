//! Metrics module for commons-billing.
//! Provides Prometheus metrics for billing operations and the ops endpoints.

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
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoices generated counter
pub static INVOICES_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Line items created counter
pub static LINE_ITEMS_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Generation runs counter
pub static GENERATION_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices swept to overdue counter
pub static OVERDUE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice amount counter (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    INVOICES_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoices_generated_total",
                "Total invoices generated by trigger"
            ),
            &["trigger"]
        )
        .expect("Failed to register INVOICES_GENERATED_TOTAL")
    });

    LINE_ITEMS_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_line_items_created_total",
                "Total line items created by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register LINE_ITEMS_CREATED_TOTAL")
    });

    GENERATION_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_generation_runs_total",
                "Total invoice generation runs by trigger and status"
            ),
            &["trigger", "status"]
        )
        .expect("Failed to register GENERATION_RUNS_TOTAL")
    });

    OVERDUE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_overdue_transitions_total",
                "Total invoices moved from sent to overdue"
            ),
            &["trigger"]
        )
        .expect("Failed to register OVERDUE_TRANSITIONS_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "billing_invoice_amount_total",
                "Total invoiced amount by trigger"
            ),
            &["trigger"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
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

/// Record a generated invoice and its total.
pub fn record_invoice_generated(trigger: &str, total: f64) {
    if let Some(counter) = INVOICES_GENERATED_TOTAL.get() {
        counter.with_label_values(&[trigger]).inc();
    }
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[trigger]).inc_by(total.abs());
    }
}

/// Record created line items.
pub fn record_line_items_created(kind: &str, count: u64) {
    if let Some(counter) = LINE_ITEMS_CREATED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc_by(count);
    }
}

/// Record a generation run outcome.
pub fn record_generation_run(trigger: &str, status: &str) {
    if let Some(counter) = GENERATION_RUNS_TOTAL.get() {
        counter.with_label_values(&[trigger, status]).inc();
    }
}

/// Record invoices swept to overdue.
pub fn record_overdue_transitions(trigger: &str, count: u64) {
    if let Some(counter) = OVERDUE_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[trigger]).inc_by(count);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
