//! Database schema constants.
//!
//! All SQL schema definitions for the SQLite episode store. Structured
//! columns (source, personas, artifacts, last error) are JSON text;
//! timestamps are Unix milliseconds.

/// SQL schema for creating the episodes table.
pub const CREATE_EPISODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    title TEXT NOT NULL,
    source TEXT NOT NULL,
    personas TEXT NOT NULL DEFAULT '[]',
    language TEXT NOT NULL DEFAULT 'en',
    generate_cover INTEGER NOT NULL DEFAULT 1,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    artifacts TEXT NOT NULL DEFAULT '{}',
    progress INTEGER NOT NULL DEFAULT 0,
    status_message TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    deleted_at INTEGER
)
"#;

pub const CREATE_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_episodes_owner_created ON episodes(owner_id, created_at)";

/// Supports the startup recovery scan over non-terminal episodes.
pub const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status)";

/// Audit trail of stage task executions, one row per started task.
pub const CREATE_TASK_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_runs (
    task_id TEXT PRIMARY KEY,
    episode_id TEXT NOT NULL REFERENCES episodes(id),
    stage TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    outcome TEXT,
    error TEXT
)
"#;

pub const CREATE_TASK_RUNS_EPISODE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_runs_episode ON task_runs(episode_id, started_at)";

/// Returns all schema creation statements in the correct order.
///
/// Statements are only ever appended; migration names are derived from the
/// position in this list.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_EPISODES_TABLE,
        CREATE_OWNER_INDEX,
        CREATE_STATUS_INDEX,
        CREATE_TASK_RUNS_TABLE,
        CREATE_TASK_RUNS_EPISODE_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const EPISODES: &str = "episodes";
    pub const TASK_RUNS: &str = "task_runs";
    pub const MIGRATIONS: &str = "_migrations";
}
