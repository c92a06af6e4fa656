//! In-process job queue.
//!
//! Same contract as the Redis queue (one outstanding task per episode,
//! delayed visibility, visibility timeout, id-fenced acks) backed by a mutex.
//! Used by tests and single-process deployments without Redis.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{JobQueue, QueueError, QueueStats};
use super::task::Task;

/// Longest a waiting consumer sleeps before rechecking for delayed tasks.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Entry {
    task: Task,
    seq: u64,
    ready_at: Instant,
    /// Visibility deadline while the task is in flight.
    invisible_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
}

/// Job queue kept in memory.
pub struct MemoryJobQueue {
    queue_name: String,
    visibility_timeout: Duration,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new(queue_name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            queue_name: queue_name.into(),
            visibility_timeout,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    fn matches(entry: &Entry, task: &Task) -> bool {
        entry.task.id == task.id
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&task.episode_id) {
            return Err(QueueError::DuplicateTask {
                episode_id: task.episode_id,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            task.episode_id,
            Entry {
                task,
                seq,
                ready_at: Instant::now() + delay,
                invisible_until: None,
            },
        );
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let next = state
            .entries
            .values_mut()
            .filter(|e| e.invisible_until.is_none() && e.ready_at <= now)
            .min_by_key(|e| (e.ready_at, e.seq));

        Ok(next.map(|entry| {
            entry.invisible_until = Some(now + self.visibility_timeout);
            entry.task.clone()
        }))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(task) = self.try_dequeue().await? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let idle = (deadline - now).min(MAX_IDLE_WAIT);
            let _ = tokio::time::timeout(idle, self.notify.notified()).await;
        }
    }

    async fn ack(&self, task: &Task) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.entries.get(&task.episode_id) {
            Some(entry) if Self::matches(entry, task) => {
                state.entries.remove(&task.episode_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, task: &Task, delay: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let released = match state.entries.get_mut(&task.episode_id) {
            Some(entry) if Self::matches(entry, task) && entry.invisible_until.is_some() => {
                entry.invisible_until = None;
                entry.ready_at = Instant::now() + delay;
                true
            }
            _ => false,
        };
        drop(state);

        if released {
            self.notify.notify_one();
        }
        Ok(released)
    }

    async fn extend(&self, task: &Task) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&task.episode_id) {
            Some(entry) if Self::matches(entry, task) && entry.invisible_until.is_some() => {
                entry.invisible_until = Some(Instant::now() + self.visibility_timeout);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_expired(&self) -> Result<Vec<Task>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<Uuid> = state
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.invisible_until, Some(deadline) if deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        let mut tasks: Vec<(u64, Task)> = expired
            .into_iter()
            .filter_map(|id| state.entries.remove(&id))
            .map(|e| (e.seq, e.task))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);

        Ok(tasks.into_iter().map(|(_, task)| task).collect())
    }

    async fn outstanding(&self, episode_id: Uuid) -> Result<Option<Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&episode_id).map(|e| e.task.clone()))
    }

    async fn remove(&self, episode_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.entries.remove(&episode_id).is_some())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let in_flight = state
            .entries
            .values()
            .filter(|e| e.invisible_until.is_some())
            .count();

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_tasks: state.entries.len() - in_flight,
            in_flight_tasks: in_flight,
        })
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new("test", Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let queue = queue();
        let episode_id = Uuid::new_v4();

        queue
            .enqueue(Task::new(episode_id, Stage::Extracted, 0), Duration::ZERO)
            .await
            .expect("first enqueue");

        let err = queue
            .enqueue(Task::new(episode_id, Stage::Extracted, 0), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateTask { episode_id: id } if id == episode_id));

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.total_tasks(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue();
        let first = Task::new(Uuid::new_v4(), Stage::Extracted, 0);
        let second = Task::new(Uuid::new_v4(), Stage::Extracted, 0);

        queue.enqueue(first.clone(), Duration::ZERO).await.expect("enqueue");
        queue.enqueue(second.clone(), Duration::ZERO).await.expect("enqueue");

        let a = queue.try_dequeue().await.expect("dequeue").expect("task");
        let b = queue.try_dequeue().await.expect("dequeue").expect("task");
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert!(queue.try_dequeue().await.expect("dequeue").is_none());
    }

    #[tokio::test]
    async fn test_delayed_task_is_invisible_until_ready() {
        let queue = queue();
        let task = Task::new(Uuid::new_v4(), Stage::Chunked, 1);
        queue
            .enqueue(task.clone(), Duration::from_millis(40))
            .await
            .expect("enqueue");

        assert!(queue.try_dequeue().await.expect("dequeue").is_none());

        let got = queue
            .dequeue(Duration::from_millis(500))
            .await
            .expect("dequeue")
            .expect("task after delay");
        assert_eq!(got.id, task.id);
    }

    #[tokio::test]
    async fn test_ack_is_fenced_by_task_id() {
        let queue = queue();
        let episode_id = Uuid::new_v4();
        let task = Task::new(episode_id, Stage::Extracted, 0);
        queue.enqueue(task.clone(), Duration::ZERO).await.expect("enqueue");
        let dequeued = queue.try_dequeue().await.expect("dequeue").expect("task");

        let stale = Task::new(episode_id, Stage::Extracted, 0);
        assert!(!queue.ack(&stale).await.expect("ack"));
        assert!(queue.outstanding(episode_id).await.expect("get").is_some());

        assert!(queue.ack(&dequeued).await.expect("ack"));
        assert!(queue.outstanding(episode_id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_visibility_timeout_reclaims_task() {
        let queue = queue();
        let task = Task::new(Uuid::new_v4(), Stage::Indexed, 0);
        queue.enqueue(task.clone(), Duration::ZERO).await.expect("enqueue");
        queue.try_dequeue().await.expect("dequeue").expect("task");

        assert!(queue.reclaim_expired().await.expect("reclaim").is_empty());
        tokio::time::sleep(Duration::from_millis(80)).await;

        let expired = queue.reclaim_expired().await.expect("reclaim");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, task.id);
        assert_eq!(queue.stats().await.expect("stats").total_tasks(), 0);
    }

    #[tokio::test]
    async fn test_extend_keeps_task_in_flight() {
        let queue = queue();
        let task = Task::new(Uuid::new_v4(), Stage::Mixed, 0);
        queue.enqueue(task.clone(), Duration::ZERO).await.expect("enqueue");
        let task = queue.try_dequeue().await.expect("dequeue").expect("task");

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(queue.extend(&task).await.expect("extend"));
        }
        assert!(queue.reclaim_expired().await.expect("reclaim").is_empty());
    }

    #[tokio::test]
    async fn test_fail_releases_for_redelivery() {
        let queue = queue();
        let task = Task::new(Uuid::new_v4(), Stage::Scripted, 0);
        queue.enqueue(task.clone(), Duration::ZERO).await.expect("enqueue");
        let task = queue.try_dequeue().await.expect("dequeue").expect("task");

        assert!(queue.fail(&task, Duration::ZERO).await.expect("fail"));
        let again = queue.try_dequeue().await.expect("dequeue").expect("redelivered");
        assert_eq!(again.id, task.id);
    }

    #[tokio::test]
    async fn test_stats_split_pending_and_in_flight() {
        let queue = queue();
        for _ in 0..3 {
            queue
                .enqueue(Task::new(Uuid::new_v4(), Stage::Extracted, 0), Duration::ZERO)
                .await
                .expect("enqueue");
        }
        queue.try_dequeue().await.expect("dequeue");

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.pending_tasks, 2);
        assert_eq!(stats.in_flight_tasks, 1);
        assert_eq!(stats.queue_name, "test");
    }
}
