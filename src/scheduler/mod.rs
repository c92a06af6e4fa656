//! Task queue and worker pool.
//!
//! This module provides the infrastructure that moves episodes through
//! their stages:
//!
//! - **JobQueue**: at-least-once task queue with per-episode dedup, delayed
//!   delivery and a visibility timeout (Redis or in-process)
//! - **WorkerPool**: pool of workers that execute stages concurrently
//! - **Task**: one unit of work, a target stage of one episode
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ enqueue(task, delay)
//!                      ┌──────▼───────┐
//!                      │   JobQueue   │◄──── reaper: reclaim_expired()
//!                      └──────┬───────┘
//!                             │ dequeue / extend / ack
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use podcast_forge::scheduler::{MemoryJobQueue, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(MemoryJobQueue::new("episodes", config.visibility_timeout));
//! let orchestrator = Arc::new(Orchestrator::new(store, queue, config.clone()));
//!
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::from_pipeline(&config),
//!     orchestrator,
//!     Arc::new(executors),
//! );
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Dedup**: at most one outstanding task per episode
//! - **Visibility timeout**: tasks of crashed workers are reclaimed and
//!   reported to the orchestrator as transient failures
//! - **Heartbeat**: long stages keep their task invisible while running
//! - **Graceful shutdown**: workers finish current stages before stopping

pub mod memory;
pub mod queue;
pub mod task;
pub mod worker_pool;

// Re-export main types for convenience
pub use memory::MemoryJobQueue;
pub use queue::{JobQueue, QueueError, QueueStats, RedisJobQueue};
pub use task::Task;
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
