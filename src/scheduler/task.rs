//! Pipeline task definitions.
//!
//! A `Task` asks a worker to produce one stage of one episode. Tasks are
//! fenced by `attempt`: a result is only applied when the episode is still
//! waiting on that exact stage and attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::Stage;

/// A unit of pipeline work stored in the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier of this delivery attempt; used to fence acks.
    pub id: Uuid,
    pub episode_id: Uuid,
    /// Stage the worker must produce.
    pub stage: Stage,
    /// Number of failed attempts that preceded this one.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(episode_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            episode_id,
            stage,
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    /// How long ago the task was enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}
