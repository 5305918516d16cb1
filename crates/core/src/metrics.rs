//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Engine synchronization (runs, torrents added/removed)
//! - Queue policy (pause/resume/demote transitions)
//! - Cached queries (hits and misses)
//! - Engine events drained
//!
//! The collectors are process globals. An application embedding a session
//! exposes them by calling [`register_metrics`] on its own registry and
//! serving [`encode_metrics`] from it.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// =============================================================================
// Synchronizer
// =============================================================================

/// Sync passes completed.
pub static SYNC_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("seedwarden_sync_runs_total", "Total synchronizer passes").unwrap()
});

/// Duration of a sync pass in seconds.
pub static SYNC_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "seedwarden_sync_duration_seconds",
            "Duration of synchronizer passes",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )
    .unwrap()
});

/// Torrents admitted into the engine.
pub static TORRENTS_ADDED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "seedwarden_torrents_added_total",
        "Torrents added to the engine",
    )
    .unwrap()
});

/// Torrents removed from the engine.
pub static TORRENTS_REMOVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "seedwarden_torrents_removed_total",
        "Torrents removed from the engine",
    )
    .unwrap()
});

/// Torrents currently managed.
pub static TORRENTS_MANAGED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "seedwarden_torrents_managed",
        "Torrents currently in the queue",
    )
    .unwrap()
});

// =============================================================================
// Queue policy
// =============================================================================

/// Queue transitions by action.
pub static QUEUE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "seedwarden_queue_transitions_total",
            "Transitions issued by the queue policy",
        ),
        &["action"], // "pause", "resume", "demote", "end_seeding", "remove", "hold"
    )
    .unwrap()
});

// =============================================================================
// Caches and events
// =============================================================================

/// Cached query lookups by cache and result.
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("seedwarden_cache_lookups_total", "Cached query lookups"),
        &["query", "result"], // result: "hit", "miss"
    )
    .unwrap()
});

/// Engine events drained by kind.
pub static ENGINE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("seedwarden_engine_events_total", "Engine events handled"),
        &["kind"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Every core collector, for registries that want to pick and choose.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(SYNC_RUNS.clone()),
        Box::new(SYNC_DURATION.clone()),
        Box::new(TORRENTS_ADDED.clone()),
        Box::new(TORRENTS_REMOVED.clone()),
        Box::new(TORRENTS_MANAGED.clone()),
        Box::new(QUEUE_TRANSITIONS.clone()),
        Box::new(CACHE_LOOKUPS.clone()),
        Box::new(ENGINE_EVENTS.clone()),
    ]
}

/// Register every core collector in `registry`.
pub fn register_metrics(registry: &Registry) -> prometheus::Result<()> {
    for collector in all_metrics() {
        registry.register(collector)?;
    }
    Ok(())
}

/// `registry` in the Prometheus text exposition format.
pub fn encode_metrics(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn test_all_metrics_register() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        QUEUE_TRANSITIONS.with_label_values(&["resume"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "seedwarden_queue_transitions_total"));
    }

    #[test]
    fn test_registering_twice_in_one_registry_fails() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        assert!(register_metrics(&registry).is_err());
    }

    #[test]
    fn test_encode_metrics_text_format() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        SYNC_RUNS.inc();

        let text = encode_metrics(&registry).unwrap();
        assert!(text.contains("# TYPE seedwarden_sync_runs_total counter"));
    }
}
