//! CLI command definitions for podcast-forge.
//!
//! Every command builds its components from [`PipelineConfig::from_env`],
//! with command-line flags taking precedence over the environment.

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::ExecutorRegistry;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    ContentSource, EpisodeStatus, NewEpisode, Orchestrator, Persona, PipelineConfig,
};
use crate::scheduler::{
    JobQueue, MemoryJobQueue, QueueStats, RedisJobQueue, WorkerPool, WorkerPoolConfig,
};
use crate::storage::{BlobStore, EpisodeStore};

/// Podcast episode generation pipeline.
#[derive(Parser)]
#[command(name = "podcast-forge")]
#[command(about = "Turn source content into multi-speaker podcast episodes")]
#[command(version)]
#[command(
    long_about = "podcast-forge drives episodes through extraction, chunking, indexing, script generation, speech synthesis, mixing and cover art.\n\nExample usage:\n  podcast-forge migrate\n  podcast-forge create --owner alice --title \"Weekly digest\" --url https://example.com/post\n  podcast-forge worker --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite URL of the episode store.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Redis URL of the task queue. Without it an in-process queue is used.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply pending database migrations.
    Migrate,

    /// Create an episode and schedule its first stage.
    Create(CreateArgs),

    /// Show the progress of an episode.
    Status(EpisodeArgs),

    /// List an owner's episodes, newest first.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show every task execution of an episode, oldest first.
    Jobs(EpisodeArgs),

    /// Resume a failed episode from the stage that failed.
    Retry(EpisodeArgs),

    /// Delete an episode; in-flight work for it is discarded.
    #[command(alias = "rm")]
    Delete(EpisodeArgs),

    /// Run the worker pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Show queue depth and episode counts by status.
    QueueStats,
}

/// Arguments for `podcast-forge create`.
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Owner of the episode.
    #[arg(long)]
    pub owner: String,

    /// Episode title.
    #[arg(long)]
    pub title: String,

    /// Inline text content.
    #[arg(long, group = "source")]
    pub text: Option<String>,

    /// Web page to extract.
    #[arg(long, group = "source")]
    pub url: Option<String>,

    /// Location of an uploaded PDF.
    #[arg(long, group = "source")]
    pub pdf: Option<String>,

    /// Transcript of a video, e.g. a YouTube URL.
    #[arg(long, group = "source")]
    pub transcript: Option<String>,

    /// Speaker as `name:role[:voice]`; repeat for several speakers.
    #[arg(long = "persona")]
    pub personas: Vec<String>,

    /// Output language.
    #[arg(long, default_value = "en")]
    pub language: String,

    /// Skip cover art generation.
    #[arg(long)]
    pub no_cover: bool,
}

/// Arguments naming a single episode.
#[derive(Parser, Debug)]
pub struct EpisodeArgs {
    /// Episode ID.
    pub id: Uuid,
}

/// Arguments for `podcast-forge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Owner whose episodes to list.
    #[arg(long)]
    pub owner: String,

    /// Maximum number of episodes to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: u32,
}

/// Arguments for `podcast-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers (overrides PODCAST_NUM_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Base URL of the stage services (overrides PODCAST_EXECUTOR_URL).
    #[arg(long)]
    pub executor_url: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(url) = cli.redis_url.filter(|u| !u.trim().is_empty()) {
        config.redis_url = Some(url);
    }

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Create(args) => run_create_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args.id).await,
        Commands::List(args) => run_list_command(config, args).await,
        Commands::Jobs(args) => run_jobs_command(config, args.id).await,
        Commands::Retry(args) => run_retry_command(config, args.id).await,
        Commands::Delete(args) => run_delete_command(config, args.id).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::QueueStats => run_queue_stats_command(config).await,
    }
}

// ============================================================================
// Component construction
// ============================================================================

async fn open_store(config: &PipelineConfig) -> anyhow::Result<EpisodeStore> {
    let store = EpisodeStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    Ok(store)
}

async fn open_queue(config: &PipelineConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    match &config.redis_url {
        Some(url) => {
            let queue =
                RedisJobQueue::connect(url, &config.queue_name, config.visibility_timeout).await?;
            Ok(Arc::new(queue))
        }
        None => {
            warn!(
                "REDIS_URL not set; using an in-process queue. Queued episodes are rescheduled when a worker starts"
            );
            Ok(Arc::new(MemoryJobQueue::new(
                config.queue_name.clone(),
                config.visibility_timeout,
            )))
        }
    }
}

async fn open_orchestrator(config: PipelineConfig) -> anyhow::Result<Orchestrator> {
    let store = open_store(&config).await?;
    let queue = open_queue(&config).await?;
    Ok(Orchestrator::new(store, queue, config))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_migrate_command(config: &PipelineConfig) -> anyhow::Result<()> {
    let store = EpisodeStore::connect(&config.database_url).await?;
    let applied = store.run_migrations().await?;
    println!("Applied {} migration(s) to {}", applied, config.database_url);
    Ok(())
}

async fn run_create_command(config: PipelineConfig, args: CreateArgs) -> anyhow::Result<()> {
    let source = content_source(&args)?;
    let mut request = NewEpisode::new(args.owner, args.title, source).with_language(args.language);
    for raw in &args.personas {
        request = request.with_persona(parse_persona(raw)?);
    }
    if args.no_cover {
        request = request.without_cover();
    }

    let orchestrator = open_orchestrator(config).await?;
    let episode = orchestrator.create_episode(request).await?;
    print_json(&episode.status_view())
}

async fn run_status_command(config: PipelineConfig, id: Uuid) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    print_json(&orchestrator.status(id).await?)
}

async fn run_list_command(config: PipelineConfig, args: ListArgs) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let episodes = orchestrator.list_by_owner(&args.owner, args.limit).await?;
    let views: Vec<_> = episodes.iter().map(|e| e.status_view()).collect();
    print_json(&views)
}

async fn run_jobs_command(config: PipelineConfig, id: Uuid) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    print_json(&orchestrator.task_history(id).await?)
}

async fn run_retry_command(config: PipelineConfig, id: Uuid) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let episode = orchestrator.retry_episode(id).await?;
    print_json(&episode.status_view())
}

async fn run_delete_command(config: PipelineConfig, id: Uuid) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    orchestrator.delete_episode(id).await?;
    println!("Deleted episode {}", id);
    Ok(())
}

async fn run_worker_command(mut config: PipelineConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(url) = args.executor_url {
        config.executor_url = url;
    }
    config.validate()?;

    init_metrics()?;

    let blobs = BlobStore::new(config.blob_path.clone());
    let executors = Arc::new(ExecutorRegistry::http(&config, blobs)?);
    let pool_config = WorkerPoolConfig::from_pipeline(&config);
    let orchestrator = Arc::new(open_orchestrator(config).await?);

    let mut pool = WorkerPool::new(pool_config, orchestrator, executors);
    pool.start().await?;

    info!(workers = pool.num_workers(), "Waiting for Ctrl-C");
    tokio::signal::ctrl_c().await?;

    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        succeeded = stats.stages_succeeded,
        failed = stats.stages_failed,
        discarded = stats.tasks_discarded,
        reclaimed = stats.tasks_reclaimed,
        success_rate = stats.success_rate(),
        "Worker pool stopped"
    );
    info!(metrics = %export_metrics(), "Final metrics");
    Ok(())
}

#[derive(Debug, Serialize)]
struct QueueStatsOutput {
    queue: QueueStats,
    episodes: Vec<StatusCount>,
}

#[derive(Debug, Serialize)]
struct StatusCount {
    status: EpisodeStatus,
    count: i64,
}

async fn run_queue_stats_command(config: PipelineConfig) -> anyhow::Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let queue = orchestrator.queue().stats().await?;
    let episodes = orchestrator
        .store()
        .count_by_status()
        .await?
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect();

    print_json(&QueueStatsOutput { queue, episodes })
}

// ============================================================================
// Argument parsing helpers
// ============================================================================

fn content_source(args: &CreateArgs) -> anyhow::Result<ContentSource> {
    if let Some(content) = &args.text {
        return Ok(ContentSource::Text {
            content: content.clone(),
        });
    }
    if let Some(url) = &args.url {
        return Ok(ContentSource::Url { url: url.clone() });
    }
    if let Some(location) = &args.pdf {
        return Ok(ContentSource::Pdf {
            location: location.clone(),
        });
    }
    if let Some(url) = &args.transcript {
        return Ok(ContentSource::Transcript { url: url.clone() });
    }
    Err(anyhow::anyhow!(
        "One of --text, --url, --pdf or --transcript is required"
    ))
}

fn parse_persona(raw: &str) -> anyhow::Result<Persona> {
    let mut parts = raw.splitn(3, ':').map(str::trim);
    let name = parts.next().filter(|s| !s.is_empty());
    let role = parts.next().filter(|s| !s.is_empty());

    match (name, role) {
        (Some(name), Some(role)) => {
            let persona = Persona::new(name, role);
            Ok(match parts.next().filter(|s| !s.is_empty()) {
                Some(voice) => persona.with_voice(voice),
                None => persona,
            })
        }
        _ => Err(anyhow::anyhow!(
            "Invalid persona '{}': expected name:role[:voice]",
            raw
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_persona() {
        let host = parse_persona("Ada:host").expect("persona");
        assert_eq!(host, Persona::new("Ada", "host"));

        let guest = parse_persona("Grace : guest : nova").expect("persona");
        assert_eq!(guest, Persona::new("Grace", "guest").with_voice("nova"));

        assert!(parse_persona("Ada").is_err());
        assert!(parse_persona(":host").is_err());
    }

    #[test]
    fn test_jobs_takes_episode_id() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["podcast-forge", "jobs", &id.to_string()]).expect("parse");
        let Commands::Jobs(args) = cli.command else {
            panic!("expected jobs command");
        };
        assert_eq!(args.id, id);

        assert!(Cli::try_parse_from(["podcast-forge", "jobs", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_create_requires_single_source() {
        let parsed = Cli::try_parse_from([
            "podcast-forge",
            "create",
            "--owner",
            "alice",
            "--title",
            "T",
            "--text",
            "a",
            "--url",
            "https://example.com",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_content_source_from_args() {
        let cli = Cli::try_parse_from([
            "podcast-forge",
            "create",
            "--owner",
            "alice",
            "--title",
            "T",
            "--pdf",
            "uploads/paper.pdf",
            "--persona",
            "Ada:host",
            "--no-cover",
        ])
        .expect("parse");

        let Commands::Create(args) = cli.command else {
            panic!("expected create command");
        };
        assert_eq!(
            content_source(&args).expect("source"),
            ContentSource::Pdf {
                location: "uploads/paper.pdf".to_string()
            }
        );
        assert_eq!(args.personas, vec!["Ada:host".to_string()]);
        assert!(args.no_cover);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "podcast-forge",
            "queue-stats",
            "--log-level",
            "debug",
            "--database-url",
            "sqlite::memory:",
        ])
        .expect("parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        assert!(matches!(cli.command, Commands::QueueStats));
    }
}
