//! SQLite episode state store.
//!
//! The store is the single source of truth for pipeline progress. Every
//! write is a compare-and-swap on the row's `version`, so concurrent writers
//! (workers, the reaper, API calls) never silently overwrite each other.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::{Episode, EpisodeStatus, Stage, StageError, TaskRun};

use super::migrations::MigrationRunner;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The row changed since it was read.
    #[error("Version conflict on episode {id}: expected version {expected_version}")]
    Conflict { id: Uuid, expected_version: i64 },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// Episode state store backed by SQLite.
#[derive(Clone)]
pub struct EpisodeStore {
    pool: SqlitePool,
}

impl EpisodeStore {
    /// Connects to the database and returns a new store.
    ///
    /// In-memory databases (`sqlite::memory:`) are pinned to one connection
    /// that never expires; each new connection would otherwise see an empty
    /// database.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a new store from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    /// Inserts a freshly created episode.
    pub async fn insert(&self, episode: &Episode) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO episodes (
                id, owner_id, title, source, personas, language, generate_cover,
                stage, status, attempt_count, last_error, artifacts, progress,
                status_message, version, created_at, updated_at, completed_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(episode.id.to_string())
        .bind(&episode.owner_id)
        .bind(&episode.title)
        .bind(serde_json::to_string(&episode.source)?)
        .bind(serde_json::to_string(&episode.personas)?)
        .bind(&episode.language)
        .bind(episode.generate_cover)
        .bind(episode.stage.as_str())
        .bind(episode.status.as_str())
        .bind(i64::from(episode.attempt_count))
        .bind(encode_optional_json(&episode.last_error)?)
        .bind(serde_json::to_string(&episode.artifacts)?)
        .bind(i64::from(episode.progress))
        .bind(&episode.status_message)
        .bind(episode.version)
        .bind(episode.created_at.timestamp_millis())
        .bind(episode.updated_at.timestamp_millis())
        .bind(episode.completed_at.map(|t| t.timestamp_millis()))
        .bind(episode.deleted_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieves an episode by its ID, including soft-deleted ones.
    pub async fn get(&self, id: Uuid) -> Result<Option<Episode>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM episodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(episode_from_row).transpose()
    }

    /// Writes `episode` if the stored row is still at `episode.version`.
    ///
    /// Returns the stored episode with its version bumped. Fails with
    /// [`DatabaseError::Conflict`] when another writer got there first and
    /// [`DatabaseError::NotFound`] when the row does not exist.
    pub async fn update(&self, episode: &Episode) -> Result<Episode, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE episodes SET
                stage = ?, status = ?, attempt_count = ?, last_error = ?,
                artifacts = ?, progress = ?, status_message = ?,
                updated_at = ?, completed_at = ?, deleted_at = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(episode.stage.as_str())
        .bind(episode.status.as_str())
        .bind(i64::from(episode.attempt_count))
        .bind(encode_optional_json(&episode.last_error)?)
        .bind(serde_json::to_string(&episode.artifacts)?)
        .bind(i64::from(episode.progress))
        .bind(&episode.status_message)
        .bind(episode.updated_at.timestamp_millis())
        .bind(episode.completed_at.map(|t| t.timestamp_millis()))
        .bind(episode.deleted_at.map(|t| t.timestamp_millis()))
        .bind(episode.id.to_string())
        .bind(episode.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM episodes WHERE id = ?")
                .bind(episode.id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => DatabaseError::Conflict {
                    id: episode.id,
                    expected_version: episode.version,
                },
                None => DatabaseError::NotFound(episode.id),
            });
        }

        let mut stored = episode.clone();
        stored.version += 1;
        Ok(stored)
    }

    /// Lists an owner's episodes, newest first, excluding deleted ones.
    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<Episode>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM episodes
            WHERE owner_id = ? AND deleted_at IS NULL
            ORDER BY created_at DESC, id
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(episode_from_row).collect()
    }

    /// Episodes still waiting on pipeline work (queued or running, not deleted).
    pub async fn list_active(&self) -> Result<Vec<Episode>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM episodes
            WHERE status IN ('queued', 'running') AND deleted_at IS NULL
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(episode_from_row).collect()
    }

    /// Counts non-deleted episodes per status.
    pub async fn count_by_status(&self) -> Result<Vec<(EpisodeStatus, i64)>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM episodes WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(EpisodeStatus, i64), DatabaseError> {
                let status: String = row.try_get("status")?;
                let status = status.parse().map_err(DatabaseError::Corrupt)?;
                Ok((status, row.try_get("n")?))
            })
            .collect()
    }

    // =========================================================================
    // Task runs
    // =========================================================================

    /// Records the start of a task execution. A redelivered task keeps its
    /// original row.
    pub async fn start_task_run(&self, run: &TaskRun) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO task_runs (task_id, episode_id, stage, attempt, started_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(run.task_id.to_string())
        .bind(run.episode_id.to_string())
        .bind(run.stage.as_str())
        .bind(i64::from(run.attempt))
        .bind(run.started_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Closes the open run of `episode_id` for `stage` and `attempt`.
    ///
    /// Returns whether a run was closed. Runs are matched by attempt rather
    /// than task id so results charged by the reaper or the recovery scan
    /// close the run of the task they stand in for.
    pub async fn finish_task_run(
        &self,
        episode_id: Uuid,
        stage: Stage,
        attempt: u32,
        outcome: &str,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE task_runs SET finished_at = ?, outcome = ?, error = ?
            WHERE episode_id = ? AND stage = ? AND attempt = ? AND finished_at IS NULL
            "#,
        )
        .bind(finished_at.timestamp_millis())
        .bind(outcome)
        .bind(error)
        .bind(episode_id.to_string())
        .bind(stage.as_str())
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All runs of an episode, oldest first.
    pub async fn list_task_runs(&self, episode_id: Uuid) -> Result<Vec<TaskRun>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM task_runs WHERE episode_id = ? ORDER BY started_at, rowid",
        )
        .bind(episode_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_run_from_row).collect()
    }
}

fn encode_optional_json<T: serde::Serialize>(
    value: &Option<T>,
) -> Result<Option<String>, DatabaseError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DatabaseError::from)
}

fn millis_to_datetime(column: &str, ms: i64) -> Result<DateTime<Utc>, DatabaseError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DatabaseError::Corrupt(format!("{} out of range: {}", column, ms)))
}

fn episode_from_row(row: &SqliteRow) -> Result<Episode, DatabaseError> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| DatabaseError::Corrupt(format!("id: {}", e)))?;

    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    let personas: String = row.try_get("personas")?;
    let artifacts: String = row.try_get("artifacts")?;
    let last_error: Option<String> = row.try_get("last_error")?;

    let attempt_count: i64 = row.try_get("attempt_count")?;
    let progress: i64 = row.try_get("progress")?;

    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    let deleted_at: Option<i64> = row.try_get("deleted_at")?;

    Ok(Episode {
        id,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        source: serde_json::from_str(&source)?,
        personas: serde_json::from_str(&personas)?,
        language: row.try_get("language")?,
        generate_cover: row.try_get("generate_cover")?,
        stage: Stage::from_str(&stage).map_err(DatabaseError::Corrupt)?,
        status: EpisodeStatus::from_str(&status).map_err(DatabaseError::Corrupt)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| DatabaseError::Corrupt(format!("attempt_count: {}", attempt_count)))?,
        last_error: last_error
            .as_deref()
            .map(serde_json::from_str::<StageError>)
            .transpose()?,
        artifacts: serde_json::from_str(&artifacts)?,
        progress: u8::try_from(progress)
            .map_err(|_| DatabaseError::Corrupt(format!("progress: {}", progress)))?,
        status_message: row.try_get("status_message")?,
        version: row.try_get("version")?,
        created_at: millis_to_datetime("created_at", created_at)?,
        updated_at: millis_to_datetime("updated_at", updated_at)?,
        completed_at: completed_at
            .map(|ms| millis_to_datetime("completed_at", ms))
            .transpose()?,
        deleted_at: deleted_at
            .map(|ms| millis_to_datetime("deleted_at", ms))
            .transpose()?,
    })
}

fn task_run_from_row(row: &SqliteRow) -> Result<TaskRun, DatabaseError> {
    let parse_uuid = |column: &str| -> Result<Uuid, DatabaseError> {
        let raw: String = row.try_get(column)?;
        Uuid::parse_str(&raw).map_err(|e| DatabaseError::Corrupt(format!("{}: {}", column, e)))
    };

    let stage: String = row.try_get("stage")?;
    let attempt: i64 = row.try_get("attempt")?;
    let started_at: i64 = row.try_get("started_at")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;

    Ok(TaskRun {
        task_id: parse_uuid("task_id")?,
        episode_id: parse_uuid("episode_id")?,
        stage: Stage::from_str(&stage).map_err(DatabaseError::Corrupt)?,
        attempt: u32::try_from(attempt)
            .map_err(|_| DatabaseError::Corrupt(format!("attempt: {}", attempt)))?,
        started_at: millis_to_datetime("started_at", started_at)?,
        finished_at: finished_at
            .map(|ms| millis_to_datetime("finished_at", ms))
            .transpose()?,
        outcome: row.try_get("outcome")?,
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ArtifactRef, ContentSource, FailureKind, NewEpisode};

    async fn store() -> EpisodeStore {
        let store = EpisodeStore::connect("sqlite::memory:")
            .await
            .expect("connect");
        store.run_migrations().await.expect("migrate");
        store
    }

    fn episode(owner: &str) -> Episode {
        let request = NewEpisode::new(
            owner,
            "Async Rust",
            ContentSource::Url {
                url: "https://example.com/post".to_string(),
            },
        );
        Episode::from_request(request, Utc::now())
    }

    #[test]
    fn test_database_error_display() {
        let id = Uuid::new_v4();
        let err = DatabaseError::Conflict {
            id,
            expected_version: 3,
        };
        assert!(err.to_string().contains("expected version 3"));
        assert!(DatabaseError::NotFound(id).to_string().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = store().await;
        let mut original = episode("owner-a");
        original.last_error = Some(StageError::new(
            FailureKind::Transient,
            Stage::Extracted,
            "fetch timed out",
        ));
        store.insert(&original).await.expect("insert");

        let loaded = store.get(original.id).await.expect("get").expect("exists");
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.source, original.source);
        assert_eq!(loaded.artifacts, original.artifacts);
        assert_eq!(loaded.last_error, original.last_error);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            original.created_at.timestamp_millis()
        );

        assert!(store.get(Uuid::new_v4()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_detects_conflict() {
        let store = store().await;
        let original = episode("owner-a");
        store.insert(&original).await.expect("insert");

        let mut first = original.clone();
        first.stage = Stage::Extracted;
        first
            .artifacts
            .insert(Stage::Extracted, ArtifactRef::inline(serde_json::json!({"text": "hi"})));
        let stored = store.update(&first).await.expect("update");
        assert_eq!(stored.version, 1);

        // A writer still holding version 0 loses.
        let mut stale = original.clone();
        stale.status = EpisodeStatus::Failed;
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { expected_version: 0, .. }));

        let loaded = store.get(original.id).await.expect("get").expect("exists");
        assert_eq!(loaded.stage, Stage::Extracted);
        assert_eq!(loaded.status, EpisodeStatus::Queued);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_task_runs_open_and_close_by_attempt() {
        let store = store().await;
        let owner = episode("owner-a");
        store.insert(&owner).await.expect("insert");

        let run = TaskRun {
            task_id: Uuid::new_v4(),
            episode_id: owner.id,
            stage: Stage::Extracted,
            attempt: 0,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            error: None,
        };
        store.start_task_run(&run).await.expect("start");
        // Redelivery of the same task
        store.start_task_run(&run).await.expect("start again");

        let runs = store.list_task_runs(owner.id).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert!(runs[0].is_open());

        // Wrong attempt closes nothing.
        let closed = store
            .finish_task_run(owner.id, Stage::Extracted, 1, "success", None, Utc::now())
            .await
            .expect("finish");
        assert!(!closed);

        let closed = store
            .finish_task_run(owner.id, Stage::Extracted, 0, "transient_failure", Some("timeout"), Utc::now())
            .await
            .expect("finish");
        assert!(closed);

        let runs = store.list_task_runs(owner.id).await.expect("list");
        assert_eq!(runs[0].task_id, run.task_id);
        assert_eq!(runs[0].outcome.as_deref(), Some("transient_failure"));
        assert_eq!(runs[0].error.as_deref(), Some("timeout"));
        assert!(!runs[0].is_open());

        // Already closed
        let closed = store
            .finish_task_run(owner.id, Stage::Extracted, 0, "success", None, Utc::now())
            .await
            .expect("finish");
        assert!(!closed);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = store().await;
        let ghost = episode("owner-a");

        let err = store.update(&ghost).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(id) if id == ghost.id));
    }

    #[tokio::test]
    async fn test_list_by_owner_excludes_deleted_and_respects_limit() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut e = episode("owner-a");
            e.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.insert(&e).await.expect("insert");
            ids.push(e.id);
        }
        store.insert(&episode("owner-b")).await.expect("insert");

        let mut deleted = store.get(ids[0]).await.expect("get").expect("exists");
        deleted.deleted_at = Some(Utc::now());
        store.update(&deleted).await.expect("delete");

        let listed = store.list_by_owner("owner-a", 10).await.expect("list");
        assert_eq!(listed.len(), 2);
        // Newest first
        assert_eq!(listed[0].id, ids[2]);

        let limited = store.list_by_owner("owner-a", 1).await.expect("list");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_list_active_and_counts() {
        let store = store().await;
        let queued = episode("o");
        let mut done = episode("o");
        done.status = EpisodeStatus::Succeeded;
        store.insert(&queued).await.expect("insert");
        store.insert(&done).await.expect("insert");

        let active = store.list_active().await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, queued.id);

        let counts = store.count_by_status().await.expect("counts");
        assert!(counts.contains(&(EpisodeStatus::Queued, 1)));
        assert!(counts.contains(&(EpisodeStatus::Succeeded, 1)));
    }
}
