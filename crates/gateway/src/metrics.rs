//! Prometheus metrics for the gateway
//!
//! Tracks ingestion, connection lifecycle, persistence and event volume.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::event::EventKind;

const LABEL_REASON: &str = "reason";
const LABEL_KIND: &str = "kind";

/// Readings inserted into the shared buffer
static READINGS_INGESTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sensor_gateway_readings_ingested_total",
        "Total readings received from sensor nodes"
    )
    .expect("Failed to register readings_ingested_total metric")
});

/// Readings appended to the storage file
static READINGS_PERSISTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sensor_gateway_readings_persisted_total",
        "Total readings written to the storage file"
    )
    .expect("Failed to register readings_persisted_total metric")
});

/// Connections accepted over the lifetime of the process
static CONNECTIONS_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sensor_gateway_connections_accepted_total",
        "Total sensor connections accepted"
    )
    .expect("Failed to register connections_accepted_total metric")
});

/// Connection handler terminations by reason (closed, timeout, error)
static CONNECTIONS_TERMINATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensor_gateway_connections_terminated_total",
        "Total sensor connection handlers terminated",
        &[LABEL_REASON]
    )
    .expect("Failed to register connections_terminated_total metric")
});

/// Handlers currently running
static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sensor_gateway_active_connections",
        "Number of connection handlers currently running"
    )
    .expect("Failed to register active_connections metric")
});

/// Events sent to the event log, by kind
static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sensor_gateway_events_total",
        "Total events sent to the event log",
        &[LABEL_KIND]
    )
    .expect("Failed to register events_total metric")
});

pub fn inc_readings_ingested() {
    READINGS_INGESTED_TOTAL.inc();
}

pub fn inc_readings_persisted() {
    READINGS_PERSISTED_TOTAL.inc();
}

pub fn inc_connections_accepted() {
    CONNECTIONS_ACCEPTED_TOTAL.inc();
    ACTIVE_CONNECTIONS.inc();
}

/// Record a handler exit. `reason` is one of "closed", "timeout", "error".
pub fn connection_terminated(reason: &str) {
    CONNECTIONS_TERMINATED_TOTAL.with_label_values(&[reason]).inc();
    ACTIVE_CONNECTIONS.dec();
}

pub fn inc_event(kind: EventKind) {
    EVENTS_TOTAL.with_label_values(&[kind.as_str()]).inc();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
