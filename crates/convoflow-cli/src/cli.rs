//! CLI argument definitions for Convoflow.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Convoflow -- conversational flow runtime.
#[derive(Parser)]
#[command(
    name = "convoflow",
    version,
    about = "Convoflow -- conversational flow runtime",
    long_about = "Runs declarative conversational flows against a terminal, one turn per line."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Talk to a set of flows on stdin.
    Run {
        /// Flow definitions (a JSON array or a single flow object).
        #[arg(long)]
        flows: PathBuf,

        /// Tool definitions (a JSON array or a single tool object).
        #[arg(long)]
        tools: Option<PathBuf>,

        /// Engine configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Session file, loaded at start and rewritten after every turn.
        #[arg(long, short)]
        session: Option<PathBuf>,

        /// User id attached to tool calls.
        #[arg(long, default_value = "local")]
        user: String,

        /// Override the configured locale.
        #[arg(long)]
        locale: Option<String>,
    },

    /// Check flow and tool definitions without running them.
    Validate {
        #[arg(long)]
        flows: PathBuf,

        #[arg(long)]
        tools: Option<PathBuf>,
    },
}
