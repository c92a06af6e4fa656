//! Prometheus-based monitoring for the pipeline.
//!
//! # Example
//!
//! ```ignore
//! use podcast_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_stage(Stage::Scripted, "success", 12.0);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, DISCARDED_RESULTS_TOTAL, EPISODES_TERMINAL_TOTAL, QUEUE_DEPTH, REGISTRY,
    STAGE_DURATION, STAGE_OUTCOMES_TOTAL,
};
