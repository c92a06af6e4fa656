//! Episode generation pipeline.
//!
//! An episode moves through a fixed sequence of stages, from the received
//! content source to a mixed audio file with cover art:
//!
//! ```text
//! received → extracted → chunked → indexed → scripted
//!          → synthesized → mixed → covered → complete
//! ```
//!
//! - **Stage**: the ordered milestones and the result type executors return
//! - **Episode**: the persisted record, the single source of truth for
//!   progress and resumability
//! - **Orchestrator**: applies stage results to episodes with optimistic
//!   concurrency and schedules the next task
//! - **Config**: retry policy and runtime settings
//!
//! # Example
//!
//! ```rust,ignore
//! use podcast_forge::pipeline::{ContentSource, NewEpisode, Orchestrator, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = Orchestrator::new(store, queue, config);
//!
//! let episode = orchestrator
//!     .create_episode(NewEpisode::new(
//!         "owner-1",
//!         "Weekly digest",
//!         ContentSource::Url { url: "https://example.com/post".into() },
//!     ))
//!     .await?;
//!
//! let view = orchestrator.status(episode.id).await?;
//! println!("{} {} {}%", view.stage, view.status, view.progress);
//! ```
//!
//! # Failure Handling
//!
//! - **Transient** failures are retried with exponential backoff until the
//!   retry policy is exhausted
//! - **Permanent** failures stop the episode at the failing stage; an
//!   explicit retry resumes from there without recomputing earlier stages

pub mod config;
pub mod episode;
pub mod orchestrator;
pub mod stage;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig, RetryPolicy};
pub use episode::{
    ContentSource, Episode, EpisodeStatus, EpisodeStatusView, NewEpisode, Persona, TaskRun,
};
pub use orchestrator::{
    BeginOutcome, Orchestrator, OrchestratorError, RecoveryReport, ReportOutcome,
};
pub use stage::{ArtifactRef, FailureKind, Stage, StageError, StageResult};
