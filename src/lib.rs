//! podcast-forge: durable orchestration for podcast episode generation.
//!
//! This library turns source content into multi-speaker podcast episodes
//! through a sequence of slow, failure-prone stages, tracking each episode
//! so that any stage can be retried and a crashed worker costs at most one
//! stage retry.

// Core modules
pub mod cli;
pub mod executor;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use executor::ExecutionError;
pub use pipeline::{ConfigError, OrchestratorError};
pub use scheduler::{PoolError, QueueError};
pub use storage::{BlobError, DatabaseError, MigrationError};
