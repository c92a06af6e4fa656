//! Episode records and the request types that create them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{ArtifactRef, Stage, StageError};

/// Execution state of the episode's current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    /// A task for the next stage is waiting in the queue.
    Queued,
    /// A worker is executing the next stage.
    Running,
    /// The pipeline reached `Complete`.
    Succeeded,
    /// The pipeline stopped; see `last_error`.
    Failed,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeStatus::Queued => "queued",
            EpisodeStatus::Running => "running",
            EpisodeStatus::Succeeded => "succeeded",
            EpisodeStatus::Failed => "failed",
        }
    }

    /// Whether no further tasks will be scheduled without external action.
    pub fn is_terminal(self) -> bool {
        matches!(self, EpisodeStatus::Succeeded | EpisodeStatus::Failed)
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EpisodeStatus::Queued),
            "running" => Ok(EpisodeStatus::Running),
            "succeeded" => Ok(EpisodeStatus::Succeeded),
            "failed" => Ok(EpisodeStatus::Failed),
            other => Err(format!("unknown episode status '{}'", other)),
        }
    }
}

/// Where the episode's content comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSource {
    Text { content: String },
    Url { url: String },
    Pdf { location: String },
    Transcript { url: String },
}

impl ContentSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentSource::Text { .. } => "text",
            ContentSource::Url { .. } => "url",
            ContentSource::Pdf { .. } => "pdf",
            ContentSource::Transcript { .. } => "transcript",
        }
    }

    /// Rejects sources that can never be processed.
    pub fn validate(&self) -> Result<(), String> {
        let (field, value) = match self {
            ContentSource::Text { content } => ("content", content),
            ContentSource::Url { url } | ContentSource::Transcript { url } => ("url", url),
            ContentSource::Pdf { location } => ("location", location),
        };
        if value.trim().is_empty() {
            return Err(format!("{} source requires a non-empty {}", self.kind(), field));
        }
        Ok(())
    }
}

/// A speaker in the generated conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    /// Role in the conversation (e.g. "host", "expert").
    pub role: String,
    /// Voice identifier handed to speech synthesis.
    #[serde(default)]
    pub voice: Option<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// Request to create a new episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpisode {
    pub owner_id: String,
    pub title: String,
    pub source: ContentSource,
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_generate_cover")]
    pub generate_cover: bool,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_generate_cover() -> bool {
    true
}

impl NewEpisode {
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>, source: ContentSource) -> Self {
        Self {
            owner_id: owner_id.into(),
            title: title.into(),
            source,
            personas: Vec::new(),
            language: default_language(),
            generate_cover: default_generate_cover(),
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.personas.push(persona);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn without_cover(mut self) -> Self {
        self.generate_cover = false;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.owner_id.trim().is_empty() {
            return Err("owner_id cannot be empty".to_string());
        }
        if self.title.trim().is_empty() {
            return Err("title cannot be empty".to_string());
        }
        self.source.validate()
    }
}

/// Persisted state of one episode: the single source of truth for resuming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub source: ContentSource,
    pub personas: Vec<Persona>,
    pub language: String,
    pub generate_cover: bool,
    /// Last milestone durably reached.
    pub stage: Stage,
    pub status: EpisodeStatus,
    pub attempt_count: u32,
    pub last_error: Option<StageError>,
    /// Append-only map from reached stage to its output.
    pub artifacts: BTreeMap<Stage, ArtifactRef>,
    pub progress: u8,
    pub status_message: Option<String>,
    /// Optimistic-concurrency counter, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Builds a fresh episode at `Received` with the source recorded as its first artifact.
    pub fn from_request(request: NewEpisode, now: DateTime<Utc>) -> Self {
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            Stage::Received,
            ArtifactRef::inline(serde_json::json!({ "source": request.source })),
        );

        Self {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            title: request.title,
            source: request.source,
            personas: request.personas,
            language: request.language,
            generate_cover: request.generate_cover,
            stage: Stage::Received,
            status: EpisodeStatus::Queued,
            attempt_count: 0,
            last_error: None,
            artifacts,
            progress: Stage::Received.progress(),
            status_message: Some(Stage::Received.working_message().to_string()),
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted_at: None,
        }
    }

    /// Stage the next task must produce, `None` once complete.
    pub fn next_stage(&self) -> Option<Stage> {
        self.stage.next()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.status == EpisodeStatus::Failed
    }

    /// Stage where the episode died, if it failed.
    pub fn failed_stage(&self) -> Option<Stage> {
        if !self.is_failed() {
            return None;
        }
        self.last_error
            .as_ref()
            .map(|e| e.stage)
            .or_else(|| self.next_stage())
    }

    /// Compact view returned by status queries.
    pub fn status_view(&self) -> EpisodeStatusView {
        EpisodeStatusView {
            episode_id: self.id,
            stage: self.stage,
            status: self.status,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            failed_stage: self.failed_stage(),
            progress: self.progress,
            status_message: self.status_message.clone(),
            artifact_stages: self.artifacts.keys().copied().collect(),
            updated_at: self.updated_at,
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeStatusView {
    pub episode_id: Uuid,
    pub stage: Stage,
    pub status: EpisodeStatus,
    pub attempt_count: u32,
    pub last_error: Option<StageError>,
    pub failed_stage: Option<Stage>,
    pub progress: u8,
    pub status_message: Option<String>,
    pub artifact_stages: Vec<Stage>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a stage task, kept as an audit trail.
///
/// Opened when a worker starts the attempt and closed when its result is
/// applied or discarded. Open runs have no `finished_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub episode_id: Uuid,
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Result label (`success`, `transient_failure`, `permanent_failure`, `discarded`).
    pub outcome: Option<String>,
    pub error: Option<String>,
}

impl TaskRun {
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}
