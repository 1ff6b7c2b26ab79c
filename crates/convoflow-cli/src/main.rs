//! CLI entry point for Convoflow.
//!
//! This binary provides the `convoflow` command with subcommands for
//! running flows interactively and validating definitions.

mod cli;
mod helpers;
mod repl;
mod validate;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            flows,
            tools,
            config,
            session,
            user,
            locale,
        } => {
            repl::cmd_run(repl::RunOptions {
                flows,
                tools,
                config,
                session,
                user,
                locale,
            })
            .await
        }
        Commands::Validate { flows, tools } => validate::cmd_validate(&flows, tools.as_deref()),
    }
}
