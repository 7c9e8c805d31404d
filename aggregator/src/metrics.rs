//! Prometheus metrics for the aggregator service itself.
//!
//! Registered on the `prometheus` default registry, which also carries the
//! process collector (resident memory, CPU, open fds). The renderer folds
//! these into the scrape output next to tenant and infra families.

use once_cell::sync::Lazy;
use prometheus::proto::MetricType;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Gauge, Histogram,
};
use std::time::Instant;
use tally_shared::MetricKind;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

// ── Ingest metrics ───────────────────────────────────────────────────────────

pub static INGEST_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_ingest_requests_total",
        "Ingest requests by response status",
        &["status"]
    )
    .unwrap()
});

pub static INGEST_SAMPLES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_ingest_samples_total",
        "Samples seen by the ingestion pipeline",
        &["outcome"]
    )
    .unwrap()
});

pub static INGEST_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "tally_ingest_duration_seconds",
        "Time spent applying one ingest batch",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

// ── Registry and exposition metrics ──────────────────────────────────────────

pub static REGISTRY_INSTRUMENTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tally_registry_instruments",
        "Live tenant instruments in the registry"
    )
    .unwrap()
});

pub static RENDER_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "tally_render_duration_seconds",
        "Time spent rendering the exposition document",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

// ── Process metrics ──────────────────────────────────────────────────────────

pub static PROCESS_UPTIME: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("process_uptime_seconds", "Seconds since the service started").unwrap()
});

/// Force registration so every family shows up from the first scrape.
pub fn init() {
    Lazy::force(&STARTED_AT);
    for status in ["200", "400", "401", "413"] {
        INGEST_REQUESTS.with_label_values(&[status]);
    }
    for outcome in ["accepted", "rejected"] {
        INGEST_SAMPLES.with_label_values(&[outcome]);
    }
    Lazy::force(&INGEST_DURATION);
    Lazy::force(&REGISTRY_INSTRUMENTS);
    Lazy::force(&RENDER_DURATION);
    refresh_process_metrics();
}

/// Names and kinds of every family on the default registry.
pub fn service_families() -> Vec<(String, MetricKind)> {
    init();
    prometheus::gather()
        .iter()
        .filter_map(|family| {
            let kind = match family.get_field_type() {
                MetricType::COUNTER => MetricKind::Counter,
                MetricType::GAUGE => MetricKind::Gauge,
                MetricType::HISTOGRAM => MetricKind::Histogram,
                MetricType::SUMMARY => MetricKind::Summary,
                MetricType::UNTYPED => return None,
            };
            Some((family.get_name().to_string(), kind))
        })
        .collect()
}

pub fn refresh_process_metrics() {
    PROCESS_UPTIME.set(STARTED_AT.elapsed().as_secs_f64());
}

pub fn record_samples(accepted: usize, rejected: usize) {
    INGEST_SAMPLES
        .with_label_values(&["accepted"])
        .inc_by(accepted as f64);
    INGEST_SAMPLES
        .with_label_values(&["rejected"])
        .inc_by(rejected as f64);
}

pub fn record_request(status: u16) {
    let status = status.to_string();
    INGEST_REQUESTS.with_label_values(&[status.as_str()]).inc();
}
