//! Command-line interface for podcast-forge.
//!
//! Provides commands for creating and inspecting episodes, running the
//! worker pool and maintaining the database.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
