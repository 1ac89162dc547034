//! Prometheus metrics for the coordinator.
//!
//! Metrics cover membership (admissions, losses), the ownership state
//! machine (assignments, handoffs, rollbacks), and the routing layer
//! (frames forwarded, stale frames fenced off).
//!
//! All metrics live on a custom registry with the `gridmaster` prefix to
//! avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors fall back to unregistered
//! no-op metrics instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts};
use tracing::warn;

/// Custom Prometheus registry for coordinator metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("gridmaster".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap_or_else(|e| {
        warn!(metric = name, error = %e, "Failed to create counter, using fallback");
        IntCounter::new("fallback", "fallback").expect("fallback counter")
    });
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register counter");
    }
    counter
}

fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels).unwrap_or_else(|e| {
        warn!(metric = name, error = %e, "Failed to create counter vec, using fallback");
        IntCounterVec::new(opts!("fallback_vec", "fallback"), labels).expect("fallback counter vec")
    });
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register counter vec");
    }
    counter
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).unwrap_or_else(|e| {
        warn!(metric = name, error = %e, "Failed to create gauge, using fallback");
        IntGauge::new("fallback_gauge", "fallback").expect("fallback gauge")
    });
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register gauge");
    }
    gauge
}

/// Live peer sessions.
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        &REGISTRY,
        "active_sessions",
        "Number of live peer sessions",
    )
});

/// Members admitted over the process lifetime.
pub static MEMBERS_ADMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        &REGISTRY,
        "members_admitted_total",
        "Cluster members admitted",
    )
});

/// Members declared lost by the failure detector or disconnect.
pub static MEMBERS_LOST: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(&REGISTRY, "members_lost_total", "Cluster members lost")
});

/// Handshake rejections (duplicate identity, bad first frame).
pub static HANDSHAKES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        &REGISTRY,
        "handshakes_rejected_total",
        "Handshakes rejected",
    )
});

/// Regions currently in the Orphaned state.
pub static ORPHANED_REGIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        &REGISTRY,
        "orphaned_regions",
        "Regions awaiting reassignment",
    )
});

/// Handoff outcomes, labeled `requested`, `committed`, `timed_out`, `rejected`.
pub static HANDOFFS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "handoffs_total",
        "Region handoffs by outcome",
        &["outcome"],
    )
});

/// Frames forwarded to a single destination or broadcast.
pub static FRAMES_ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "frames_routed_total",
        "Application frames forwarded by the router",
        &["mode"],
    )
});

/// Frames dropped because their generation was behind the table.
pub static STALE_FRAMES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        &REGISTRY,
        "stale_frames_dropped_total",
        "Frames fenced off for carrying an outdated generation",
    )
});

/// Render all coordinator metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        MEMBERS_ADMITTED.inc();
        STALE_FRAMES_DROPPED.inc();
        HANDOFFS.with_label_values(&["committed"]).inc();

        let text = gather();
        assert!(text.contains("gridmaster_members_admitted_total"));
        assert!(text.contains("gridmaster_stale_frames_dropped_total"));
    }
}
