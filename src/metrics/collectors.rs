//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites stay
//! one line and never have to care whether `init_metrics()` ran.

use super::prometheus::{
    ACTIVE_WORKERS, DISCARDED_RESULTS_TOTAL, EPISODES_TERMINAL_TOTAL, QUEUE_DEPTH, STAGE_DURATION,
    STAGE_OUTCOMES_TOTAL,
};
use crate::pipeline::{EpisodeStatus, Stage};
use crate::scheduler::QueueStats;

/// Metrics collector for pipeline operations.
///
/// ```ignore
/// use podcast_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage(Stage::Synthesized, "success", 42.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one stage execution with its outcome label.
    pub fn record_stage(&self, stage: Stage, outcome: &str, duration_secs: f64) {
        if let Some(outcomes) = STAGE_OUTCOMES_TOTAL.get() {
            outcomes
                .with_label_values(&[stage.as_str(), outcome])
                .inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration
                .with_label_values(&[stage.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            stage = %stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    pub fn record_terminal(&self, status: EpisodeStatus) {
        if let Some(terminal) = EPISODES_TERMINAL_TOTAL.get() {
            terminal.with_label_values(&[status.as_str()]).inc();
        }
    }

    /// Record a result dropped by fencing (`stale`, `deleted`, ...).
    pub fn record_discard(&self, reason: &str) {
        if let Some(discarded) = DISCARDED_RESULTS_TOTAL.get() {
            discarded.with_label_values(&[reason]).inc();
        }
    }

    pub fn set_queue_depth(&self, stats: &QueueStats) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth
                .with_label_values(&[stats.queue_name.as_str(), "pending"])
                .set(stats.pending_tasks as f64);
            depth
                .with_label_values(&[stats.queue_name.as_str(), "in_flight"])
                .set(stats.in_flight_tasks as f64);
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}
