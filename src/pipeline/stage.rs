//! Pipeline stages, artifact references and stage outcomes.
//!
//! An episode walks the fixed sequence
//! `received → extracted → chunked → indexed → scripted → synthesized → mixed → covered → complete`.
//! Each forward step is produced by exactly one stage executor; the stage an
//! episode currently sits at is the last milestone that was durably recorded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position of an episode in the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Episode created, content source recorded.
    Received,
    /// Raw text extracted from the source.
    Extracted,
    /// Text split into semantic chunks.
    Chunked,
    /// Chunks embedded and indexed for retrieval.
    Indexed,
    /// Multi-speaker script generated.
    Scripted,
    /// Speech segments synthesized.
    Synthesized,
    /// Segments mixed into the final audio.
    Mixed,
    /// Cover art generated (or skipped).
    Covered,
    /// Terminal: every stage succeeded.
    Complete,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 9] = [
        Stage::Received,
        Stage::Extracted,
        Stage::Chunked,
        Stage::Indexed,
        Stage::Scripted,
        Stage::Synthesized,
        Stage::Mixed,
        Stage::Covered,
        Stage::Complete,
    ];

    /// Stages that are produced by a stage executor.
    pub const EXECUTABLE: [Stage; 7] = [
        Stage::Extracted,
        Stage::Chunked,
        Stage::Indexed,
        Stage::Scripted,
        Stage::Synthesized,
        Stage::Mixed,
        Stage::Covered,
    ];

    /// Returns the stage that follows this one, or `None` for `Complete`.
    pub fn next(self) -> Option<Stage> {
        let idx = self.index();
        Stage::ALL.get(idx + 1).copied()
    }

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Complete
    }

    /// Whether a task may target this stage.
    pub fn is_executable(self) -> bool {
        !matches!(self, Stage::Received | Stage::Complete)
    }

    /// Progress percentage reported once this stage has been reached.
    pub fn progress(self) -> u8 {
        match self {
            Stage::Received => 0,
            Stage::Extracted => 10,
            Stage::Chunked => 15,
            Stage::Indexed => 30,
            Stage::Scripted => 50,
            Stage::Synthesized => 75,
            Stage::Mixed => 90,
            Stage::Covered => 95,
            Stage::Complete => 100,
        }
    }

    /// Human-readable message shown while this stage is being produced.
    pub fn working_message(self) -> &'static str {
        match self {
            Stage::Received => "Episode received",
            Stage::Extracted => "Extracting content",
            Stage::Chunked => "Chunking content",
            Stage::Indexed => "Creating embeddings",
            Stage::Scripted => "Generating script",
            Stage::Synthesized => "Generating audio",
            Stage::Mixed => "Mixing audio",
            Stage::Covered => "Creating cover",
            Stage::Complete => "Episode complete",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Extracted => "extracted",
            Stage::Chunked => "chunked",
            Stage::Indexed => "indexed",
            Stage::Scripted => "scripted",
            Stage::Synthesized => "synthesized",
            Stage::Mixed => "mixed",
            Stage::Covered => "covered",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Reference to the durable output of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRef {
    /// Output stored in the blob store.
    Blob {
        location: String,
        checksum: String,
        size_bytes: u64,
    },
    /// Small output kept directly on the episode record.
    Inline { payload: serde_json::Value },
}

impl ArtifactRef {
    pub fn inline(payload: serde_json::Value) -> Self {
        ArtifactRef::Inline { payload }
    }
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Expected to succeed on retry (timeouts, rate limits, unavailable services).
    Transient,
    /// Retrying the same input will not help.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Structured error detail kept on an episode after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: FailureKind,
    /// Stage that was being produced when the error occurred.
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

/// Outcome reported by a stage executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(ArtifactRef),
    TransientFailure(String),
    PermanentFailure(String),
}

impl StageResult {
    pub fn transient(message: impl Into<String>) -> Self {
        StageResult::TransientFailure(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StageResult::PermanentFailure(message.into())
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Success(_) => "success",
            StageResult::TransientFailure(_) => "transient_failure",
            StageResult::PermanentFailure(_) => "permanent_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence_is_linear() {
        let mut stage = Stage::Received;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            visited.push(next);
            stage = next;
        }
        assert_eq!(visited, Stage::ALL.to_vec());
        assert_eq!(stage, Stage::Complete);
        assert!(stage.is_terminal());
    }

    #[test]
    fn test_executable_stages() {
        assert!(!Stage::Received.is_executable());
        assert!(!Stage::Complete.is_executable());
        for stage in Stage::EXECUTABLE {
            assert!(stage.is_executable());
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let progress: Vec<u8> = Stage::ALL.iter().map(|s| s.progress()).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Stage::Complete.progress(), 100);
    }

    #[test]
    fn test_stage_names_parse_back() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        assert!("cancelled".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_serializes_as_snake_case() {
        let json = serde_json::to_string(&Stage::Synthesized).expect("serialize");
        assert_eq!(json, "\"synthesized\"");
    }

    #[test]
    fn test_artifact_ref_tagging() {
        let artifact = ArtifactRef::inline(serde_json::json!({"skipped": true}));
        let value = serde_json::to_value(&artifact).expect("serialize");
        assert_eq!(value["kind"], "inline");
        assert_eq!(value["payload"]["skipped"], true);
    }

    #[test]
    fn test_stage_result_labels() {
        assert_eq!(StageResult::transient("x").label(), "transient_failure");
        assert_eq!(StageResult::permanent("x").label(), "permanent_failure");
        assert_eq!(
            StageResult::Success(ArtifactRef::inline(serde_json::Value::Null)).label(),
            "success"
        );
    }
}
