//! Metrics collection for Arbor
//!
//! TigerStyle: Explicit metric names with units, type-safe recording.
//!
//! With the `otel` feature these record into the global OpenTelemetry meter;
//! without it every function is a no-op, so call sites never need a `cfg`.

#[cfg(feature = "otel")]
use crate::constants::*;
#[cfg(feature = "otel")]
use once_cell::sync::Lazy;
#[cfg(feature = "otel")]
use opentelemetry::metrics::{Counter, Histogram};
#[cfg(feature = "otel")]
use opentelemetry::{global, KeyValue};

#[cfg(feature = "otel")]
const METER_NAME: &str = "arbor";

// Cached instruments (created once, reused for all recordings)
#[cfg(feature = "otel")]
static AGENTS_ACTIVATED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_AGENTS_ACTIVATED_TOTAL)
        .with_description("Total number of agent activations")
        .init()
});

#[cfg(feature = "otel")]
static AGENTS_DEACTIVATED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_AGENTS_DEACTIVATED_TOTAL)
        .with_description("Total number of agent deactivations")
        .init()
});

#[cfg(feature = "otel")]
static ENVELOPES_ROUTED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_ENVELOPES_ROUTED_TOTAL)
        .with_description("Total number of envelopes routed")
        .init()
});

#[cfg(feature = "otel")]
static ENVELOPES_DISCARDED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_ENVELOPES_DISCARDED_TOTAL)
        .with_description("Total number of envelopes discarded")
        .init()
});

#[cfg(feature = "otel")]
static HANDLER_FAULTS_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_HANDLER_FAULTS_TOTAL)
        .with_description("Total number of handler faults")
        .init()
});

#[cfg(feature = "otel")]
static HANDLER_DURATION_HISTOGRAM: Lazy<Histogram<f64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .f64_histogram(METRIC_NAME_HANDLER_DURATION_SECONDS)
        .with_description("Handler duration in seconds")
        .init()
});

#[cfg(feature = "otel")]
static EVENTS_CONFIRMED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_EVENTS_CONFIRMED_TOTAL)
        .with_description("Total number of events confirmed to the event store")
        .init()
});

#[cfg(feature = "otel")]
static CONFIRM_CONFLICTS_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_counter(METRIC_NAME_CONFIRM_CONFLICTS_TOTAL)
        .with_description("Total number of optimistic-concurrency conflicts")
        .init()
});

#[cfg(feature = "otel")]
static REPLAY_EVENTS_HISTOGRAM: Lazy<Histogram<u64>> = Lazy::new(|| {
    global::meter(METER_NAME)
        .u64_histogram(METRIC_NAME_REPLAY_EVENTS_COUNT)
        .with_description("Number of events applied during replay")
        .init()
});

/// Record agent activation
#[cfg(feature = "otel")]
pub fn record_agent_activated() {
    AGENTS_ACTIVATED_COUNTER.add(1, &[]);
}

/// Record agent deactivation
#[cfg(feature = "otel")]
pub fn record_agent_deactivated() {
    AGENTS_DEACTIVATED_COUNTER.add(1, &[]);
}

/// Record an envelope taken through the router
///
/// # Arguments
/// * `origin` - "local", "own_stream" or "parent_stream"
#[cfg(feature = "otel")]
pub fn record_envelope_routed(origin: &str) {
    ENVELOPES_ROUTED_COUNTER.add(1, &[KeyValue::new("origin", origin.to_string())]);
}

/// Record a protocol discard
///
/// # Arguments
/// * `reason` - "duplicate", "hop_limit", "loop", "stale_source", ...
#[cfg(feature = "otel")]
pub fn record_envelope_discarded(reason: &str) {
    ENVELOPES_DISCARDED_COUNTER.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a handler fault
#[cfg(feature = "otel")]
pub fn record_handler_fault(event_type: &str) {
    HANDLER_FAULTS_COUNTER.add(1, &[KeyValue::new("event_type", event_type.to_string())]);
}

/// Record handler duration
#[cfg(feature = "otel")]
pub fn record_handler_duration(event_type: &str, duration_seconds: f64) {
    HANDLER_DURATION_HISTOGRAM.record(
        duration_seconds,
        &[KeyValue::new("event_type", event_type.to_string())],
    );
}

/// Record events committed by one confirm
#[cfg(feature = "otel")]
pub fn record_events_confirmed(count: u64) {
    EVENTS_CONFIRMED_COUNTER.add(count, &[]);
}

/// Record an optimistic-concurrency conflict
#[cfg(feature = "otel")]
pub fn record_confirm_conflict() {
    CONFIRM_CONFLICTS_COUNTER.add(1, &[]);
}

/// Record a replay
///
/// # Arguments
/// * `events` - Events applied after the snapshot (or from version 1)
/// * `from_snapshot` - Whether replay started from a snapshot
#[cfg(feature = "otel")]
pub fn record_replay(events: u64, from_snapshot: bool) {
    REPLAY_EVENTS_HISTOGRAM.record(events, &[KeyValue::new("from_snapshot", from_snapshot)]);
}

// No-op implementations when otel feature is disabled
#[cfg(not(feature = "otel"))]
pub fn record_agent_activated() {}

#[cfg(not(feature = "otel"))]
pub fn record_agent_deactivated() {}

#[cfg(not(feature = "otel"))]
pub fn record_envelope_routed(_origin: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_envelope_discarded(_reason: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_handler_fault(_event_type: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_handler_duration(_event_type: &str, _duration_seconds: f64) {}

#[cfg(not(feature = "otel"))]
pub fn record_events_confirmed(_count: u64) {}

#[cfg(not(feature = "otel"))]
pub fn record_confirm_conflict() {}

#[cfg(not(feature = "otel"))]
pub fn record_replay(_events: u64, _from_snapshot: bool) {}
