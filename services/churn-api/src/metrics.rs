use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec, IntCounter, IntCounterVec,
};
use std::time::Instant;

use crate::error::ServiceError;

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("churn_requests_total", "Requests handled per endpoint and outcome", &["endpoint", "outcome"])
        .expect("churn_requests_total registers once")
});

static REQUEST_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "churn_request_latency_ms",
        "Request handling latency per endpoint (ms)",
        &["endpoint"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    )
    .expect("churn_request_latency_ms registers once")
});

static ROWS_PREDICTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("churn_rows_predicted_total", "Records run through transform and predict")
        .expect("churn_rows_predicted_total registers once")
});

/// Forces registration so `/metrics` lists every series from startup.
pub fn register() {
    Lazy::force(&REQUESTS_TOTAL);
    Lazy::force(&REQUEST_LATENCY_MS);
    Lazy::force(&ROWS_PREDICTED_TOTAL);
}

pub fn record_rows(n: usize) { ROWS_PREDICTED_TOTAL.inc_by(n as u64); }

pub fn observe<T>(endpoint: &str, started: Instant, outcome: &Result<T, ServiceError>) {
    let label = match outcome {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    REQUESTS_TOTAL.with_label_values(&[endpoint, label]).inc();
    REQUEST_LATENCY_MS
        .with_label_values(&[endpoint])
        .observe(started.elapsed().as_secs_f64() * 1000.0);
}
