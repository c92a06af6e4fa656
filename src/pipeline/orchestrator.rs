//! Pipeline orchestrator.
//!
//! Owns the episode state machine. Every transition is a read-modify-write
//! against the [`EpisodeStore`] guarded by the row version, and every task
//! result is fenced: it is applied only while the episode is still waiting
//! on exactly that stage and attempt. Stale, duplicate and post-deletion
//! results are discarded without touching state.
//!
//! Side effects on the queue always follow the durable write:
//! write the new state, ack the finished task, enqueue the next one. A crash
//! between those steps leaves either an outstanding task (redelivered and
//! fenced) or a queued episode without a task (picked up by
//! [`Orchestrator::recover`]).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::executor::StageContext;
use crate::metrics::MetricsCollector;
use crate::scheduler::{JobQueue, QueueError, Task};
use crate::storage::{DatabaseError, EpisodeStore};

use super::config::PipelineConfig;
use super::episode::{Episode, EpisodeStatus, EpisodeStatusView, NewEpisode, TaskRun};
use super::stage::{ArtifactRef, FailureKind, Stage, StageError, StageResult};

/// First delay between retries of an unavailable queue.
const QUEUE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Episode not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Episode {id} cannot be changed: {reason}")]
    InvalidState { id: Uuid, reason: String },

    /// Concurrent writers kept winning; only surfaces after all retries.
    #[error("Episode {id} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { id: Uuid, attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What a worker should do with a dequeued task.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// Run the stage executor with this context.
    Execute(StageContext),
    /// The target artifact already exists; report it without executing.
    AlreadyDone(ArtifactRef),
    /// The task is stale, duplicated or its episode was deleted.
    Discard,
}

/// How a reported result was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Stage recorded; the next stage was scheduled.
    Advanced { next: Stage },
    /// Last stage recorded; the episode succeeded.
    Completed,
    /// Transient failure; the same stage was rescheduled after `delay`.
    Retrying { attempt_count: u32, delay: Duration },
    /// The episode failed at `stage`.
    Failed { stage: Stage },
    /// The result did not match the episode's current state.
    Discarded,
}

/// Follow-up chosen inside a transition, executed after the write.
enum FollowUp {
    Schedule(Task, Duration),
    Terminal(EpisodeStatus),
}

/// Result of a version-checked read-modify-write.
enum Mutation<R> {
    Written(Episode, R),
    Unchanged(Episode),
}

/// Coordinates episode state, the job queue and retries.
pub struct Orchestrator {
    store: EpisodeStore,
    queue: Arc<dyn JobQueue>,
    config: PipelineConfig,
    metrics: MetricsCollector,
}

impl Orchestrator {
    pub fn new(store: EpisodeStore, queue: Arc<dyn JobQueue>, config: PipelineConfig) -> Self {
        Self {
            store,
            queue,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn store(&self) -> &EpisodeStore {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // =========================================================================
    // Episode operations
    // =========================================================================

    /// Creates an episode at `received` and schedules its first stage.
    pub async fn create_episode(&self, request: NewEpisode) -> Result<Episode, OrchestratorError> {
        request
            .validate()
            .map_err(OrchestratorError::InvalidRequest)?;

        let episode = Episode::from_request(request, Utc::now());
        self.store.insert(&episode).await?;

        tracing::info!(
            episode_id = %episode.id,
            owner_id = %episode.owner_id,
            source = episode.source.kind(),
            "Episode created"
        );

        if let Some(next) = episode.next_stage() {
            self.schedule(Task::new(episode.id, next, 0), Duration::ZERO)
                .await;
        }

        Ok(episode)
    }

    /// Returns an episode, including soft-deleted ones.
    pub async fn get(&self, id: Uuid) -> Result<Episode, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Status of a live episode; deleted episodes are reported as not found.
    pub async fn status(&self, id: Uuid) -> Result<EpisodeStatusView, OrchestratorError> {
        let episode = self.get(id).await?;
        if episode.is_deleted() {
            return Err(OrchestratorError::NotFound(id));
        }
        Ok(episode.status_view())
    }

    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<Episode>, OrchestratorError> {
        Ok(self.store.list_by_owner(owner_id, limit).await?)
    }

    /// Resumes a failed episode at the stage it died on.
    ///
    /// Artifacts of earlier stages are kept, so nothing already produced is
    /// recomputed.
    pub async fn retry_episode(&self, id: Uuid) -> Result<Episode, OrchestratorError> {
        let mutation = self
            .mutate(id, |episode| {
                if episode.is_deleted() {
                    return Err(OrchestratorError::NotFound(episode.id));
                }
                if !episode.is_failed() {
                    return Err(OrchestratorError::InvalidState {
                        id: episode.id,
                        reason: format!("status is {}, only failed episodes can be retried", episode.status),
                    });
                }
                let Some(next) = episode.next_stage() else {
                    return Err(OrchestratorError::InvalidState {
                        id: episode.id,
                        reason: "pipeline already complete".to_string(),
                    });
                };

                episode.status = EpisodeStatus::Queued;
                episode.attempt_count = 0;
                episode.last_error = None;
                episode.status_message = Some(next.working_message().to_string());
                Ok(Some(next))
            })
            .await?;

        let Mutation::Written(episode, next) = mutation else {
            return Err(OrchestratorError::InvalidState {
                id,
                reason: "episode changed during retry".to_string(),
            });
        };

        // A task left over from the failed run would block the new one.
        if let Err(e) = self.queue.remove(id).await {
            tracing::warn!(episode_id = %id, error = %e, "Failed to clear stale task before retry");
        }
        self.schedule(Task::new(id, next, 0), Duration::ZERO).await;

        tracing::info!(episode_id = %id, stage = %next, "Episode retry scheduled");
        Ok(episode)
    }

    /// Soft-deletes an episode and drops its outstanding task.
    ///
    /// Any result still in flight for it is discarded when reported.
    pub async fn delete_episode(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.mutate(id, |episode| {
            if episode.is_deleted() {
                return Ok(None);
            }
            episode.deleted_at = Some(Utc::now());
            Ok(Some(()))
        })
        .await?;

        match self.queue.remove(id).await {
            Ok(removed) => {
                tracing::info!(episode_id = %id, removed_task = removed, "Episode deleted")
            }
            Err(e) => tracing::warn!(
                episode_id = %id,
                error = %e,
                "Episode deleted but its task could not be removed; it will be discarded on delivery"
            ),
        }
        Ok(())
    }

    // =========================================================================
    // Task lifecycle
    // =========================================================================

    /// Marks the episode running for `task`, or tells the worker to drop it.
    pub async fn begin(&self, task: &Task) -> Result<BeginOutcome, OrchestratorError> {
        let mutation = self
            .mutate(task.episode_id, |episode| {
                if !accepts(episode, task) {
                    return Ok(None);
                }
                if episode.status == EpisodeStatus::Running {
                    // Redelivery of the attempt already marked running.
                    return Ok(None);
                }
                episode.status = EpisodeStatus::Running;
                episode.status_message = Some(task.stage.working_message().to_string());
                Ok(Some(()))
            })
            .await;

        let episode = match mutation {
            Ok(Mutation::Written(episode, ())) => {
                self.open_run(task).await;
                episode
            }
            Ok(Mutation::Unchanged(episode)) => episode,
            Err(OrchestratorError::NotFound(_)) => {
                self.note_discard(task, "missing");
                return Ok(BeginOutcome::Discard);
            }
            Err(e) => return Err(e),
        };

        if !accepts(&episode, task) {
            self.note_discard(task, discard_reason(&episode));
            return Ok(BeginOutcome::Discard);
        }

        if let Some(artifact) = episode.artifacts.get(&task.stage) {
            return Ok(BeginOutcome::AlreadyDone(artifact.clone()));
        }

        tracing::debug!(
            episode_id = %task.episode_id,
            stage = %task.stage,
            attempt = task.attempt,
            "Stage started"
        );
        Ok(BeginOutcome::Execute(StageContext::new(&episode, task)))
    }

    /// Applies a stage result and schedules what comes next.
    pub async fn report(
        &self,
        task: &Task,
        result: StageResult,
    ) -> Result<ReportOutcome, OrchestratorError> {
        let retry = self.config.retry;
        let mutation = self
            .mutate(task.episode_id, |episode| {
                if !accepts(episode, task) {
                    return Ok(None);
                }
                Ok(Some(apply_result(episode, task, &result, &retry)))
            })
            .await;

        let (episode, (outcome, follow_up)) = match mutation {
            Ok(Mutation::Written(episode, applied)) => (episode, applied),
            Ok(Mutation::Unchanged(episode)) => {
                self.note_discard(task, discard_reason(&episode));
                self.close_run(task, "discarded", None).await;
                self.ack(task).await;
                return Ok(ReportOutcome::Discarded);
            }
            Err(OrchestratorError::NotFound(_)) => {
                self.note_discard(task, "missing");
                self.ack(task).await;
                return Ok(ReportOutcome::Discarded);
            }
            Err(e) => return Err(e),
        };

        let error = match &result {
            StageResult::Success(_) => None,
            StageResult::TransientFailure(message) | StageResult::PermanentFailure(message) => {
                Some(message.as_str())
            }
        };
        self.close_run(task, result.label(), error).await;
        self.ack(task).await;
        match follow_up {
            FollowUp::Schedule(next, delay) => {
                if !self.schedule(next, delay).await {
                    tracing::debug!(episode_id = %episode.id, "Next task not enqueued by report");
                }
            }
            FollowUp::Terminal(status) => self.metrics.record_terminal(status),
        }

        match &outcome {
            ReportOutcome::Failed { stage } => tracing::warn!(
                episode_id = %episode.id,
                stage = %stage,
                attempt_count = episode.attempt_count,
                error = episode.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or_default(),
                "Episode failed"
            ),
            ReportOutcome::Retrying { attempt_count, delay } => tracing::info!(
                episode_id = %episode.id,
                stage = %task.stage,
                attempt_count = attempt_count,
                delay_ms = delay.as_millis() as u64,
                "Stage will be retried"
            ),
            ReportOutcome::Completed => {
                tracing::info!(episode_id = %episode.id, "Episode complete")
            }
            _ => tracing::debug!(
                episode_id = %episode.id,
                stage = %episode.stage,
                "Stage recorded"
            ),
        }

        Ok(outcome)
    }

    /// Execution history of an episode's tasks, oldest first.
    pub async fn task_history(&self, id: Uuid) -> Result<Vec<TaskRun>, OrchestratorError> {
        self.get(id).await?;
        Ok(self.store.list_task_runs(id).await?)
    }

    /// Handles a task whose visibility timeout expired without a result.
    ///
    /// The owning worker is presumed dead, which counts as a transient
    /// failure of the stage. The task is already gone from the queue.
    pub async fn handle_expired(&self, task: &Task) -> Result<ReportOutcome, OrchestratorError> {
        tracing::warn!(
            episode_id = %task.episode_id,
            stage = %task.stage,
            attempt = task.attempt,
            "Task visibility expired"
        );

        let outcome = self
            .report(task, StageResult::transient("worker lost: visibility timeout expired"))
            .await?;
        if outcome == ReportOutcome::Discarded {
            self.ensure_scheduled(task.episode_id).await?;
        }
        Ok(outcome)
    }

    /// Drops a task that `begin` rejected.
    pub async fn discard(&self, task: &Task) -> Result<(), OrchestratorError> {
        self.ack(task).await;
        self.ensure_scheduled(task.episode_id).await?;
        Ok(())
    }

    /// Enqueues the next task for a queued episode that has none.
    ///
    /// Returns whether a task was enqueued.
    pub async fn ensure_scheduled(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let Some(episode) = self.store.get(id).await? else {
            return Ok(false);
        };
        if episode.is_deleted() || episode.status != EpisodeStatus::Queued {
            return Ok(false);
        }
        let Some(next) = episode.next_stage() else {
            return Ok(false);
        };
        if self.queue.outstanding(id).await?.is_some() {
            return Ok(false);
        }

        tracing::info!(episode_id = %id, stage = %next, "Rescheduling orphaned episode");
        Ok(self
            .schedule(Task::new(id, next, episode.attempt_count), Duration::ZERO)
            .await)
    }

    /// Startup scan that restores forward progress after a crash.
    ///
    /// Queued episodes without a task are re-enqueued. Running episodes
    /// without a task lost their worker and are treated as a transient
    /// failure of their current stage.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();

        for episode in self.store.list_active().await? {
            let Some(next) = episode.next_stage() else {
                continue;
            };
            if self.queue.outstanding(episode.id).await?.is_some() {
                continue;
            }

            match episode.status {
                EpisodeStatus::Queued => {
                    if self.ensure_scheduled(episode.id).await? {
                        report.rescheduled += 1;
                    }
                }
                EpisodeStatus::Running => {
                    let lost = Task::new(episode.id, next, episode.attempt_count);
                    let outcome = self
                        .report(&lost, StageResult::transient("worker lost before restart"))
                        .await?;
                    if outcome != ReportOutcome::Discarded {
                        report.recovered_running += 1;
                    }
                }
                _ => {}
            }
        }

        tracing::info!(
            rescheduled = report.rescheduled,
            recovered_running = report.recovered_running,
            "Recovery scan finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Version-checked read-modify-write.
    ///
    /// `change` edits a fresh copy of the episode and returns `Some` to write
    /// it or `None` to leave it untouched. Conflicts re-read and re-apply.
    async fn mutate<R, F>(&self, id: Uuid, mut change: F) -> Result<Mutation<R>, OrchestratorError>
    where
        F: FnMut(&mut Episode) -> Result<Option<R>, OrchestratorError>,
    {
        let attempts = self.config.max_conflict_retries.max(1);
        for attempt in 0..attempts {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or(OrchestratorError::NotFound(id))?;

            let mut updated = current.clone();
            let Some(value) = change(&mut updated)? else {
                return Ok(Mutation::Unchanged(current));
            };
            updated.updated_at = Utc::now();

            match self.store.update(&updated).await {
                Ok(stored) => return Ok(Mutation::Written(stored, value)),
                Err(DatabaseError::Conflict { .. }) => {
                    tracing::debug!(episode_id = %id, attempt = attempt + 1, "Write conflict, retrying");
                    tokio::task::yield_now().await;
                }
                Err(DatabaseError::NotFound(missing)) => {
                    return Err(OrchestratorError::NotFound(missing))
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::ConflictRetriesExhausted { id, attempts })
    }

    /// Enqueues `task`, retrying while the queue is unavailable.
    ///
    /// Never fails the caller: state is already durable, and an episode left
    /// without a task is picked up by `recover` or `ensure_scheduled`.
    async fn schedule(&self, task: Task, delay: Duration) -> bool {
        let mut backoff = QUEUE_RETRY_BASE;
        for attempt in 0..=self.config.max_enqueue_retries {
            match self.queue.enqueue(task.clone(), delay).await {
                Ok(()) => {
                    tracing::debug!(
                        episode_id = %task.episode_id,
                        stage = %task.stage,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Task enqueued"
                    );
                    return true;
                }
                Err(QueueError::DuplicateTask { .. }) => {
                    tracing::debug!(
                        episode_id = %task.episode_id,
                        stage = %task.stage,
                        "Episode already has an outstanding task"
                    );
                    return false;
                }
                Err(e) if e.is_unavailable() && attempt < self.config.max_enqueue_retries => {
                    tracing::warn!(
                        episode_id = %task.episode_id,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Queue unavailable, retrying enqueue"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.retry.backoff_max);
                }
                Err(e) => {
                    tracing::error!(
                        episode_id = %task.episode_id,
                        stage = %task.stage,
                        error = %e,
                        "Failed to enqueue task; left for recovery"
                    );
                    return false;
                }
            }
        }
        false
    }

    /// Acks a finished task, retrying while the queue is unavailable.
    async fn ack(&self, task: &Task) {
        let mut backoff = QUEUE_RETRY_BASE;
        for attempt in 0..=self.config.max_enqueue_retries {
            match self.queue.ack(task).await {
                Ok(_) => return,
                Err(e) if e.is_unavailable() && attempt < self.config.max_enqueue_retries => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.retry.backoff_max);
                }
                Err(e) => {
                    // The task expires and is fenced on redelivery.
                    tracing::warn!(episode_id = %task.episode_id, error = %e, "Failed to ack task");
                    return;
                }
            }
        }
    }

    /// Opens the audit row for a task that just moved its episode to running.
    async fn open_run(&self, task: &Task) {
        let run = TaskRun {
            task_id: task.id,
            episode_id: task.episode_id,
            stage: task.stage,
            attempt: task.attempt,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
        };
        if let Err(e) = self.store.start_task_run(&run).await {
            tracing::warn!(episode_id = %task.episode_id, task_id = %task.id, error = %e, "Failed to record task run");
        }
    }

    /// Closes the audit row of `task`'s attempt, if one is open.
    async fn close_run(&self, task: &Task, outcome: &str, error: Option<&str>) {
        if let Err(e) = self
            .store
            .finish_task_run(task.episode_id, task.stage, task.attempt, outcome, error, Utc::now())
            .await
        {
            tracing::warn!(episode_id = %task.episode_id, task_id = %task.id, error = %e, "Failed to close task run");
        }
    }

    fn note_discard(&self, task: &Task, reason: &str) {
        tracing::info!(
            episode_id = %task.episode_id,
            stage = %task.stage,
            attempt = task.attempt,
            reason = reason,
            "Discarding task"
        );
        self.metrics.record_discard(reason);
    }
}

/// Summary of a recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queued episodes that got their missing task back.
    pub rescheduled: usize,
    /// Running episodes charged a transient failure.
    pub recovered_running: usize,
}

/// Whether a result for `task` may still change `episode`.
fn accepts(episode: &Episode, task: &Task) -> bool {
    !episode.is_deleted()
        && matches!(episode.status, EpisodeStatus::Queued | EpisodeStatus::Running)
        && episode.next_stage() == Some(task.stage)
        && episode.attempt_count == task.attempt
}

fn discard_reason(episode: &Episode) -> &'static str {
    if episode.is_deleted() {
        "deleted"
    } else {
        "stale"
    }
}

/// The transition table. Mutates `episode` for `result` and decides the
/// follow-up queue action.
fn apply_result(
    episode: &mut Episode,
    task: &Task,
    result: &StageResult,
    retry: &super::config::RetryPolicy,
) -> (ReportOutcome, FollowUp) {
    match result {
        StageResult::Success(artifact) => {
            episode
                .artifacts
                .entry(task.stage)
                .or_insert_with(|| artifact.clone());
            episode.stage = task.stage;
            episode.attempt_count = 0;
            episode.last_error = None;
            episode.progress = task.stage.progress();

            match task.stage.next() {
                Some(Stage::Complete) | None => {
                    episode.stage = Stage::Complete;
                    episode.status = EpisodeStatus::Succeeded;
                    episode.progress = Stage::Complete.progress();
                    episode.status_message = Some(Stage::Complete.working_message().to_string());
                    episode.completed_at = Some(Utc::now());
                    (
                        ReportOutcome::Completed,
                        FollowUp::Terminal(EpisodeStatus::Succeeded),
                    )
                }
                Some(next) => {
                    episode.status = EpisodeStatus::Queued;
                    episode.status_message = Some(next.working_message().to_string());
                    (
                        ReportOutcome::Advanced { next },
                        FollowUp::Schedule(Task::new(episode.id, next, 0), Duration::ZERO),
                    )
                }
            }
        }
        StageResult::TransientFailure(message) => {
            episode.attempt_count += 1;
            episode.last_error = Some(StageError::new(
                FailureKind::Transient,
                task.stage,
                message.clone(),
            ));

            if retry.allows_retry(episode.attempt_count) {
                let delay = retry.backoff(episode.attempt_count);
                episode.status = EpisodeStatus::Queued;
                episode.status_message = Some(format!(
                    "Retrying {} (attempt {} of {})",
                    task.stage,
                    episode.attempt_count + 1,
                    retry.max_retries
                ));
                (
                    ReportOutcome::Retrying {
                        attempt_count: episode.attempt_count,
                        delay,
                    },
                    FollowUp::Schedule(
                        Task::new(episode.id, task.stage, episode.attempt_count),
                        delay,
                    ),
                )
            } else {
                fail(episode, task.stage)
            }
        }
        StageResult::PermanentFailure(message) => {
            episode.last_error = Some(StageError::new(
                FailureKind::Permanent,
                task.stage,
                message.clone(),
            ));
            fail(episode, task.stage)
        }
    }
}

fn fail(episode: &mut Episode, stage: Stage) -> (ReportOutcome, FollowUp) {
    episode.status = EpisodeStatus::Failed;
    episode.status_message = Some(format!("Failed while producing {}", stage));
    (
        ReportOutcome::Failed { stage },
        FollowUp::Terminal(EpisodeStatus::Failed),
    )
}
