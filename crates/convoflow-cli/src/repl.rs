//! Subcommand: `convoflow run` -- interactive turn loop.
//!
//! Every stdin line is one user turn.  The session is kept in memory and,
//! with `--session`, rewritten to disk after each turn so a later run can
//! resume mid-flow.

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use convoflow_engine::{FlowEngine, NoClassifier, Turn};
use tracing::{error, info};

use crate::helpers::{init_tracing, load_config, load_flows, load_session, load_tools, save_session};

/// Leaves the loop.  Not a flow command, so it never reaches the engine.
const EXIT_COMMAND: &str = "/exit";

pub struct RunOptions {
    pub flows: PathBuf,
    pub tools: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub session: Option<PathBuf>,
    pub user: String,
    pub locale: Option<String>,
}

pub async fn cmd_run(options: RunOptions) -> Result<()> {
    init_tracing("warn");

    let config = load_config(options.config.as_deref(), options.locale)?;
    let engine = FlowEngine::builder()
        .flows(load_flows(&options.flows)?)
        .tools(load_tools(options.tools.as_deref())?)
        .intent_classifier(Arc::new(NoClassifier))
        .config(config)
        .build()
        .context("failed to build the flow engine")?;

    let mut session = load_session(&engine, options.session.as_deref(), &options.user)?;
    info!(session_id = %session.id, flows = engine.flows().len(), "ready");

    println!("Convoflow -- type a message, or {EXIT_COMMAND} to leave.");
    if let Some(frame) = session.active()
        && let Some(prompt) = &frame.pending_prompt
    {
        println!("{prompt}");
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == EXIT_COMMAND {
            break;
        }

        match engine.update_activity(&Turn::user(text), &session).await {
            Ok(result) => {
                if !result.response.is_empty() {
                    println!("{}", result.response);
                }
                session = result.session;
            }
            Err(e) => {
                error!(error = %e, "turn rejected");
                println!("error: {e}");
                continue;
            }
        }

        if let Some(path) = &options.session {
            save_session(path, &session)?;
        }
    }

    println!();
    Ok(())
}
