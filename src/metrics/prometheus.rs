//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by podcast-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all podcast-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage executions, labeled by stage and outcome (success/transient/permanent).
pub static STAGE_OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tasks in the queue, labeled by queue name and state (pending/in_flight).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently executing a stage.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Episodes that reached a terminal status, labeled by status.
pub static EPISODES_TERMINAL_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Results discarded by attempt fencing, labeled by reason.
pub static DISCARDED_RESULTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// statics from the first call in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Stage metrics
    let stage_outcomes_total = CounterVec::new(
        Opts::new(
            "podcast_forge_stage_outcomes_total",
            "Stage executions by outcome",
        ),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "podcast_forge_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["stage"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("podcast_forge_queue_depth", "Number of tasks in queue"),
        &["queue_name", "state"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "podcast_forge_active_workers",
        "Number of workers executing a stage",
    )?;

    // Episode metrics
    let episodes_terminal_total = CounterVec::new(
        Opts::new(
            "podcast_forge_episodes_terminal_total",
            "Episodes that reached a terminal status",
        ),
        &["status"],
    )?;

    let discarded_results_total = CounterVec::new(
        Opts::new(
            "podcast_forge_discarded_results_total",
            "Stage results dropped because the episode moved on",
        ),
        &["reason"],
    )?;

    registry.register(Box::new(stage_outcomes_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(episodes_terminal_total.clone()))?;
    registry.register(Box::new(discarded_results_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGE_OUTCOMES_TOTAL.set(stage_outcomes_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = EPISODES_TERMINAL_TOTAL.set(episodes_terminal_total);
    let _ = DISCARDED_RESULTS_TOTAL.set(discarded_results_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
