//! Prometheus Metrics Module
//!
//! Gateway-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - Active connection and online user gauges
//! - Fan-out event counts by event kind
//! - Disconnect counts by cause
//! - Broker reconnects and dropped publishes

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active registered connections gauge
pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("connections_active", "Number of registered connections").namespace("signalink"),
    )
    .expect("Failed to create CONNECTIONS_ACTIVE metric")
});

/// Users currently online or away
pub static USERS_ONLINE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("users_online", "Number of users online or away").namespace("signalink"),
    )
    .expect("Failed to create USERS_ONLINE metric")
});

/// Events delivered to local connections, by event kind
pub static EVENTS_FANNED_OUT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_fanned_out_total", "Events delivered to local connections")
            .namespace("signalink"),
        &["kind"],
    )
    .expect("Failed to create EVENTS_FANNED_OUT metric")
});

/// Connection removals, by cause
pub static DISCONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("disconnects_total", "Connections removed from the registry")
            .namespace("signalink"),
        &["cause"],
    )
    .expect("Failed to create DISCONNECTS_TOTAL metric")
});

/// Broker reconnect attempts
pub static BROKER_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("broker_reconnects_total", "Broker reconnect attempts").namespace("signalink"),
    )
    .expect("Failed to create BROKER_RECONNECTS metric")
});

/// Events dropped because the publish queue was full
pub static PUBLISHES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("publishes_dropped_total", "Events dropped at the publish queue")
            .namespace("signalink"),
    )
    .expect("Failed to create PUBLISHES_DROPPED metric")
});

/// Events dropped because the event-log queue was full
pub static EVENT_LOG_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("event_log_dropped_total", "Events dropped at the event-log queue")
            .namespace("signalink"),
    )
    .expect("Failed to create EVENT_LOG_DROPPED metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(USERS_ONLINE.clone()))
        .expect("Failed to register USERS_ONLINE");
    registry
        .register(Box::new(EVENTS_FANNED_OUT.clone()))
        .expect("Failed to register EVENTS_FANNED_OUT");
    registry
        .register(Box::new(DISCONNECTS_TOTAL.clone()))
        .expect("Failed to register DISCONNECTS_TOTAL");
    registry
        .register(Box::new(BROKER_RECONNECTS.clone()))
        .expect("Failed to register BROKER_RECONNECTS");
    registry
        .register(Box::new(PUBLISHES_DROPPED.clone()))
        .expect("Failed to register PUBLISHES_DROPPED");
    registry
        .register(Box::new(EVENT_LOG_DROPPED.clone()))
        .expect("Failed to register EVENT_LOG_DROPPED");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics should be valid UTF-8")
}

pub fn set_connections(count: i64) {
    CONNECTIONS_ACTIVE.set(count);
}

pub fn set_users_online(count: i64) {
    USERS_ONLINE.set(count);
}

pub fn record_fan_out(kind: &str, delivered: u64) {
    EVENTS_FANNED_OUT.with_label_values(&[kind]).inc_by(delivered);
}

pub fn record_disconnect(cause: &str) {
    DISCONNECTS_TOTAL.with_label_values(&[cause]).inc();
}

pub fn record_broker_reconnect() {
    BROKER_RECONNECTS.inc();
}

pub fn record_dropped_publish() {
    PUBLISHES_DROPPED.inc();
}

pub fn record_dropped_event() {
    EVENT_LOG_DROPPED.inc();
}
