//! Stage executors.
//!
//! A stage executor produces the artifact for one target stage from the
//! artifacts of the stages before it. Executors classify their own
//! failures: a [`StageResult`] is always either a success, a transient
//! failure (retry may help) or a permanent one.
//!
//! The [`ExecutorRegistry`] binds every executable stage to exactly one
//! executor and is the only thing workers call.

pub mod http;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::{
    ArtifactRef, ContentSource, Episode, PipelineConfig, Persona, Stage, StageResult,
};
use crate::scheduler::Task;
use crate::storage::BlobStore;

pub use http::HttpStageExecutor;

/// Errors raised while setting up executors.
///
/// Failures during execution are never errors; they are classified into
/// [`StageResult`] instead.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No executor bound to stage '{0}'")]
    MissingExecutor(Stage),

    #[error("Stage '{0}' has more than one executor")]
    DuplicateExecutor(Stage),

    #[error("Stage '{0}' is not executable")]
    NotExecutable(Stage),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Everything an executor may read when producing its stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub episode_id: Uuid,
    /// Target stage to produce.
    pub stage: Stage,
    pub attempt: u32,
    pub title: String,
    pub source: ContentSource,
    pub personas: Vec<Persona>,
    pub language: String,
    pub generate_cover: bool,
    /// Outputs of every stage reached so far.
    pub artifacts: BTreeMap<Stage, ArtifactRef>,
}

impl StageContext {
    pub fn new(episode: &Episode, task: &Task) -> Self {
        Self {
            episode_id: episode.id,
            stage: task.stage,
            attempt: task.attempt,
            title: episode.title.clone(),
            source: episode.source.clone(),
            personas: episode.personas.clone(),
            language: episode.language.clone(),
            generate_cover: episode.generate_cover,
            artifacts: episode.artifacts.clone(),
        }
    }
}

/// Produces the artifact for one target stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Target stage this executor produces.
    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &StageContext) -> StageResult;
}

/// Maps each executable stage to its executor.
pub struct ExecutorRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.executors.keys().collect();
        stages.sort();
        f.debug_struct("ExecutorRegistry")
            .field("stages", &stages)
            .finish()
    }
}

impl ExecutorRegistry {
    /// Builds a registry, failing unless every executable stage has exactly
    /// one executor.
    pub fn new(executors: Vec<Arc<dyn StageExecutor>>) -> Result<Self, ExecutionError> {
        let mut map: HashMap<Stage, Arc<dyn StageExecutor>> = HashMap::new();
        for executor in executors {
            let stage = executor.stage();
            if !stage.is_executable() {
                return Err(ExecutionError::NotExecutable(stage));
            }
            if map.insert(stage, executor).is_some() {
                return Err(ExecutionError::DuplicateExecutor(stage));
            }
        }

        if let Some(missing) = Stage::EXECUTABLE.iter().find(|s| !map.contains_key(*s)) {
            return Err(ExecutionError::MissingExecutor(*missing));
        }

        Ok(Self { executors: map })
    }

    /// One HTTP executor per stage, posting to `{executor_url}/{stage}`.
    pub fn http(config: &PipelineConfig, blobs: BlobStore) -> Result<Self, ExecutionError> {
        let client = reqwest::Client::builder()
            .timeout(config.executor_timeout)
            .build()?;

        let executors = Stage::EXECUTABLE
            .iter()
            .map(|&stage| {
                Arc::new(
                    HttpStageExecutor::new(stage, &config.executor_url, client.clone(), blobs.clone())
                        .with_inline_limit(config.inline_limit_bytes),
                ) as Arc<dyn StageExecutor>
            })
            .collect();

        Self::new(executors)
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageExecutor>> {
        self.executors.get(&stage)
    }

    /// Runs the executor for `ctx.stage`.
    ///
    /// Cover generation is skipped with an inline marker artifact when the
    /// episode opted out of it.
    pub async fn execute(&self, ctx: &StageContext) -> StageResult {
        if ctx.stage == Stage::Covered && !ctx.generate_cover {
            return StageResult::Success(ArtifactRef::inline(serde_json::json!({ "skipped": true })));
        }

        match self.executors.get(&ctx.stage) {
            Some(executor) => executor.execute(ctx).await,
            None => StageResult::permanent(format!("no executor for stage '{}'", ctx.stage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NewEpisode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        stage: Stage,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StageExecutor for Fixed {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn execute(&self, ctx: &StageContext) -> StageResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StageResult::Success(ArtifactRef::inline(serde_json::json!({ "stage": ctx.stage })))
        }
    }

    fn fixed(stage: Stage) -> Arc<Fixed> {
        Arc::new(Fixed {
            stage,
            calls: AtomicUsize::new(0),
        })
    }

    fn all_fixed() -> Vec<Arc<dyn StageExecutor>> {
        Stage::EXECUTABLE
            .iter()
            .map(|&s| fixed(s) as Arc<dyn StageExecutor>)
            .collect()
    }

    fn context(stage: Stage, generate_cover: bool) -> StageContext {
        let mut request = NewEpisode::new(
            "owner",
            "Title",
            ContentSource::Text {
                content: "body".to_string(),
            },
        );
        request.generate_cover = generate_cover;
        let episode = Episode::from_request(request, chrono::Utc::now());
        StageContext::new(&episode, &Task::new(episode.id, stage, 0))
    }

    #[test]
    fn test_registry_requires_every_stage() {
        let mut executors = all_fixed();
        executors.retain(|e| e.stage() != Stage::Mixed);

        let err = ExecutorRegistry::new(executors).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingExecutor(Stage::Mixed)));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_terminal_stages() {
        let mut executors = all_fixed();
        executors.push(fixed(Stage::Chunked));
        assert!(matches!(
            ExecutorRegistry::new(executors).unwrap_err(),
            ExecutionError::DuplicateExecutor(Stage::Chunked)
        ));

        let mut executors = all_fixed();
        executors.push(fixed(Stage::Complete));
        assert!(matches!(
            ExecutorRegistry::new(executors).unwrap_err(),
            ExecutionError::NotExecutable(Stage::Complete)
        ));
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_stage() {
        let registry = ExecutorRegistry::new(all_fixed()).expect("registry");
        let result = registry.execute(&context(Stage::Indexed, true)).await;

        match result {
            StageResult::Success(ArtifactRef::Inline { payload }) => {
                assert_eq!(payload["stage"], "indexed");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cover_skipped_when_disabled() {
        let cover = fixed(Stage::Covered);
        let mut executors = all_fixed();
        executors.retain(|e| e.stage() != Stage::Covered);
        executors.push(cover.clone());
        let registry = ExecutorRegistry::new(executors).expect("registry");

        let result = registry.execute(&context(Stage::Covered, false)).await;
        assert_eq!(
            result,
            StageResult::Success(ArtifactRef::inline(serde_json::json!({ "skipped": true })))
        );
        assert_eq!(cover.calls.load(Ordering::SeqCst), 0);

        registry.execute(&context(Stage::Covered, true)).await;
        assert_eq!(cover.calls.load(Ordering::SeqCst), 1);
    }
}
