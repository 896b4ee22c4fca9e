//! Prometheus metrics collection for the room-state engine.
//!
//! Tracks pipeline throughput, snapshot write behavior, conflict
//! resolution, and input-record failure modes. Exposed on the HTTP
//! listener's `/metrics` endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Input records committed, by kind.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref EVENTS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("roomserver_events_processed_total", "Input events committed by kind"),
        &["kind"]
    ).expect("EVENTS_PROCESSED metric creation failed");

    /// Pipeline latency per input record, by kind.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref EVENT_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "roomserver_event_duration_seconds",
            "Input pipeline latency by kind"
        )
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["kind"]
    ).expect("EVENT_LATENCY metric creation failed");

    /// Snapshot writes, by how the snapshot was produced: shared with an
    /// existing snapshot, a delta block append, or a full single-block
    /// write (collapse, combination, or resolution).
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref SNAPSHOTS_WRITTEN: IntCounterVec = IntCounterVec::new(
        Opts::new("roomserver_state_snapshots_total", "Snapshot writes by mode"),
        &["mode"]
    ).expect("SNAPSHOTS_WRITTEN metric creation failed");

    /// Conflicted state keys resolved by the auth-gated resolver.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref CONFLICTS_RESOLVED: IntCounter = IntCounter::new(
        "roomserver_conflicts_resolved_total",
        "Conflicted state keys resolved"
    ).expect("CONFLICTS_RESOLVED metric creation failed");

    /// Conflict blocks where every candidate failed the auth predicate and
    /// the first candidate was used as a last resort.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref DEGRADED_RESOLUTIONS: IntCounter = IntCounter::new(
        "roomserver_degraded_resolutions_total",
        "Conflict blocks resolved by last-resort fallback"
    ).expect("DEGRADED_RESOLUTIONS metric creation failed");

    /// Input records that could not be committed, by error code.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref INPUT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("roomserver_input_failures_total", "Input record failures by error code"),
        &["code"]
    ).expect("INPUT_FAILURES metric creation failed");

    /// Records currently deferred waiting for missing dependencies.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref DEFERRED_INPUTS: IntCounterVec = IntCounterVec::new(
        Opts::new("roomserver_deferred_inputs_total", "Deferral events by reason"),
        &["reason"]
    ).expect("DEFERRED_INPUTS metric creation failed");

    /// Rooms known to the store.
    // SAFETY: Metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref ROOMS: IntGauge = IntGauge::new(
        "roomserver_rooms",
        "Rooms known to the store"
    ).expect("ROOMS metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Call once at startup; repeated registration is reported as an error by
/// prometheus and ignored here so tests can share the process registry.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(EVENTS_PROCESSED.clone()));
    let _ = REGISTRY.register(Box::new(EVENT_LATENCY.clone()));
    let _ = REGISTRY.register(Box::new(SNAPSHOTS_WRITTEN.clone()));
    let _ = REGISTRY.register(Box::new(CONFLICTS_RESOLVED.clone()));
    let _ = REGISTRY.register(Box::new(DEGRADED_RESOLUTIONS.clone()));
    let _ = REGISTRY.register(Box::new(INPUT_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(DEFERRED_INPUTS.clone()));
    let _ = REGISTRY.register(Box::new(ROOMS.clone()));
}

/// Record a committed input record.
pub fn record_processed(kind: &str, duration_secs: f64) {
    EVENTS_PROCESSED.with_label_values(&[kind]).inc();
    EVENT_LATENCY
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Gather all metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
