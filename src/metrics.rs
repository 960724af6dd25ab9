//! Prometheus counters for the ingest path.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static EVENTS_PROCESSED: OnceLock<IntCounter> = OnceLock::new();
static SESSIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
    let events_processed = EVENTS_PROCESSED.get_or_init(|| {
        IntCounter::new(
            "processed_tracking_events_total",
            "The total number of processed tracking events",
        )
        .unwrap()
    });
    let sessions_total = SESSIONS_TOTAL.get_or_init(|| {
        IntCounter::new("sessions_total", "The total number of sessions").unwrap()
    });

    REGISTRY.register(Box::new(events_processed.clone())).ok();
    REGISTRY.register(Box::new(sessions_total.clone())).ok();
}

pub fn inc_events_processed() {
    if let Some(counter) = EVENTS_PROCESSED.get() {
        counter.inc();
    }
}

pub fn inc_sessions() {
    if let Some(counter) = SESSIONS_TOTAL.get() {
        counter.inc();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("failed to encode metrics: {}", e);
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
