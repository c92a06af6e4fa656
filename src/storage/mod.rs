//! Persistent storage.
//!
//! # Overview
//!
//! - **EpisodeStore**: SQLite store for episode state with optimistic
//!   concurrency on a per-row `version`
//! - **BlobStore**: content-addressed files for large stage outputs
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use podcast_forge::storage::{BlobStore, EpisodeStore};
//!
//! let store = EpisodeStore::connect("sqlite:podcast_forge.db").await?;
//! store.run_migrations().await?;
//!
//! let episode = store.get(episode_id).await?;
//!
//! let blobs = BlobStore::new("./podcast_outputs");
//! let artifact = blobs.put(&audio_bytes).await?;
//! ```

pub mod blobs;
pub mod database;
pub mod migrations;
pub mod schema;

pub use blobs::{BlobError, BlobStore};
pub use database::{DatabaseError, EpisodeStore};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
