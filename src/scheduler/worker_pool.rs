//! Worker pool for executing pipeline stages.
//!
//! Each worker runs as an independent async task: it dequeues a task, asks
//! the orchestrator whether to run it, executes the stage while
//! heartbeating the task's visibility, and reports the classified result.
//! A reaper task turns expired tasks (crashed or stuck workers) into
//! transient failures.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Visibility heartbeat while a stage runs
//! - Reaper for expired tasks
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorRegistry, StageContext};
use crate::metrics::MetricsCollector;
use crate::pipeline::{BeginOutcome, Orchestrator, PipelineConfig, ReportOutcome, StageResult};

use super::queue::{JobQueue, QueueError};
use super::task::Task;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue waits for a task before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Visibility timeout of the queue the pool consumes.
    pub visibility_timeout: Duration,
    /// How often a running stage extends its task's visibility.
    pub heartbeat_interval: Duration,
    /// How often the reaper looks for expired tasks.
    pub reaper_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(100),
            reaper_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Derives pool settings from the pipeline configuration.
    ///
    /// Heartbeats fire three times per visibility window.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            poll_interval: config.poll_interval,
            visibility_timeout: config.visibility_timeout,
            heartbeat_interval: config.visibility_timeout / 3,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the visibility timeout and a matching heartbeat interval.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self.heartbeat_interval = timeout / 3;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.reaper_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "heartbeat_interval and reaper_interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.visibility_timeout {
            return Err(PoolError::InvalidConfig(format!(
                "heartbeat_interval ({:?}) must be shorter than visibility_timeout ({:?})",
                self.heartbeat_interval, self.visibility_timeout
            )));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a stage.
    pub active_workers: usize,
    /// Stage executions that succeeded.
    pub stages_succeeded: u64,
    /// Stage executions that failed (transient or permanent).
    pub stages_failed: u64,
    /// Tasks dropped because the episode moved on.
    pub tasks_discarded: u64,
    /// Tasks reclaimed after their visibility timeout.
    pub tasks_reclaimed: u64,
    /// Average stage execution duration.
    pub average_stage_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of stages executed (succeeded + failed).
    pub fn total_processed(&self) -> u64 {
        self.stages_succeeded + self.stages_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.stages_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    stages_succeeded: AtomicU64,
    stages_failed: AtomicU64,
    tasks_discarded: AtomicU64,
    tasks_reclaimed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            stages_succeeded: AtomicU64::new(0),
            stages_failed: AtomicU64::new(0),
            tasks_discarded: AtomicU64::new(0),
            tasks_reclaimed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_execution(&self, succeeded: bool, duration: Duration) {
        let counter = if succeeded {
            &self.stages_succeeded
        } else {
            &self.stages_failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_discard(&self) {
        self.tasks_discarded.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reclaimed(&self) {
        self.tasks_reclaimed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.stages_succeeded.load(Ordering::SeqCst);
        let failed = self.stages_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            stages_succeeded: succeeded,
            stages_failed: failed,
            tasks_discarded: self.tasks_discarded.load(Ordering::SeqCst),
            tasks_reclaimed: self.tasks_reclaimed.load(Ordering::SeqCst),
            average_stage_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing tasks from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    executors: Arc<ExecutorRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool consuming the orchestrator's queue.
    pub fn new(
        config: WorkerPoolConfig,
        orchestrator: Arc<Orchestrator>,
        executors: Arc<ExecutorRegistry>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue: Arc::clone(orchestrator.queue()),
            orchestrator,
            executors,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Runs crash recovery, then starts the workers and the reaper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::InvalidConfig` for an unusable configuration.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        match self.orchestrator.recover().await {
            Ok(report) => {
                if report.rescheduled + report.recovered_running > 0 {
                    info!(
                        rescheduled = report.rescheduled,
                        recovered_running = report.recovered_running,
                        "Recovered episodes from previous run"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Recovery scan failed");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                orchestrator: Arc::clone(&self.orchestrator),
                executors: Arc::clone(&self.executors),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                heartbeat_interval: self.config.heartbeat_interval,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.handles.push(tokio::spawn(worker.run()));
        }

        let reaper = Reaper {
            queue: Arc::clone(&self.queue),
            orchestrator: Arc::clone(&self.orchestrator),
            shutdown_rx: self.shutdown_tx.subscribe(),
            interval: self.config.reaper_interval,
            stats: Arc::clone(&self.stats),
            metrics: MetricsCollector::new(),
        };
        self.handles.push(tokio::spawn(reaper.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the stage they are executing before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }
}

/// A single worker that executes stages from the queue.
struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    executors: Arc<ExecutorRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
    /// How long one dequeue waits when the queue is empty.
    poll_interval: Duration,
    heartbeat_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously polls for tasks and processes them until a shutdown
    /// signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(task)) => {
                    self.process_task(task).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single task.
    async fn process_task(&self, task: Task) {
        let result = match self.orchestrator.begin(&task).await {
            Ok(BeginOutcome::Execute(ctx)) => {
                info!(
                    worker_id = %self.id,
                    episode_id = %task.episode_id,
                    stage = %task.stage,
                    attempt = task.attempt,
                    "Executing stage"
                );
                match self.execute(&task, &ctx).await {
                    Some(result) => result,
                    None => {
                        self.stats.record_discard();
                        return;
                    }
                }
            }
            Ok(BeginOutcome::AlreadyDone(artifact)) => {
                debug!(
                    worker_id = %self.id,
                    episode_id = %task.episode_id,
                    stage = %task.stage,
                    "Stage output already recorded"
                );
                StageResult::Success(artifact)
            }
            Ok(BeginOutcome::Discard) => {
                self.stats.record_discard();
                if let Err(e) = self.orchestrator.discard(&task).await {
                    warn!(worker_id = %self.id, episode_id = %task.episode_id, error = %e, "Failed to discard task");
                }
                return;
            }
            Err(e) => {
                error!(worker_id = %self.id, episode_id = %task.episode_id, error = %e, "Failed to begin task");
                self.release(&task).await;
                return;
            }
        };

        match self.orchestrator.report(&task, result).await {
            Ok(ReportOutcome::Discarded) => self.stats.record_discard(),
            Ok(outcome) => debug!(
                worker_id = %self.id,
                episode_id = %task.episode_id,
                outcome = ?outcome,
                "Result applied"
            ),
            Err(e) => {
                error!(worker_id = %self.id, episode_id = %task.episode_id, error = %e, "Failed to report result");
                self.release(&task).await;
            }
        }
    }

    /// Runs the executor while heartbeating the task's visibility.
    ///
    /// Returns `None` when the task was lost to the reaper; its result
    /// would be fenced anyway.
    async fn execute(&self, task: &Task, ctx: &StageContext) -> Option<StageResult> {
        let started = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let execution = self.executors.execute(ctx);
        tokio::pin!(execution);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut execution => break Some(result),
                _ = heartbeat.tick() => match self.queue.extend(task).await {
                    Ok(true) => debug!(worker_id = %self.id, episode_id = %task.episode_id, "Extended task visibility"),
                    Ok(false) => {
                        warn!(
                            worker_id = %self.id,
                            episode_id = %task.episode_id,
                            stage = %task.stage,
                            "Task no longer owned, abandoning stage"
                        );
                        break None;
                    }
                    Err(e) => warn!(worker_id = %self.id, episode_id = %task.episode_id, error = %e, "Heartbeat failed"),
                },
            }
        };

        let duration = started.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        if let Some(result) = &result {
            self.stats
                .record_execution(matches!(result, StageResult::Success(_)), duration);
            self.metrics
                .record_stage(task.stage, result.label(), duration.as_secs_f64());
            info!(
                worker_id = %self.id,
                episode_id = %task.episode_id,
                stage = %task.stage,
                outcome = result.label(),
                duration_ms = duration.as_millis() as u64,
                "Stage finished"
            );
        }
        result
    }

    /// Makes the task visible again so another delivery retries it.
    async fn release(&self, task: &Task) {
        if let Err(e) = self.queue.fail(task, self.poll_interval).await {
            warn!(worker_id = %self.id, episode_id = %task.episode_id, error = %e, "Failed to release task");
        }
    }
}

/// Periodically reclaims expired tasks and routes them to the orchestrator.
struct Reaper {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Reaper {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }
            self.sweep().await;
        }
        debug!("Reaper stopped");
    }

    async fn sweep(&self) {
        match self.queue.reclaim_expired().await {
            Ok(expired) => {
                for task in expired {
                    self.stats.record_reclaimed();
                    if let Err(e) = self.orchestrator.handle_expired(&task).await {
                        error!(
                            episode_id = %task.episode_id,
                            stage = %task.stage,
                            error = %e,
                            "Failed to handle expired task; left for recovery"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to reclaim expired tasks"),
        }

        if let Ok(stats) = self.queue.stats().await {
            self.metrics.set_queue_depth(&stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_poll_interval(Duration::from_millis(50))
            .with_visibility_timeout(Duration::from_secs(30))
            .with_reaper_interval(Duration::from_secs(2))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.reaper_interval, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_from_pipeline() {
        let pipeline = PipelineConfig::default()
            .with_num_workers(6)
            .with_visibility_timeout(Duration::from_secs(90));
        let config = WorkerPoolConfig::from_pipeline(&pipeline);

        assert_eq!(config.num_workers, 6);
        assert_eq!(config.visibility_timeout, Duration::from_secs(90));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::new(0).validate().is_err());

        let slow_heartbeat = WorkerPoolConfig::default()
            .with_visibility_timeout(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_secs(10));
        let err = slow_heartbeat.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval"));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            stages_succeeded: 80,
            stages_failed: 20,
            tasks_discarded: 3,
            tasks_reclaimed: 1,
            average_stage_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_execution(true, Duration::from_secs(10));
        stats.record_execution(true, Duration::from_secs(20));
        stats.record_execution(false, Duration::from_secs(5));
        stats.record_discard();
        stats.record_reclaimed();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.stages_succeeded, 2);
        assert_eq!(pool_stats.stages_failed, 1);
        assert_eq!(pool_stats.tasks_discarded, 1);
        assert_eq!(pool_stats.tasks_reclaimed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_stage_duration.as_millis() > 11000);
        assert!(pool_stats.average_stage_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
