//! Shared helpers: tracing setup and definition/session files.

use std::path::Path;

use anyhow::{Context, Result};
use convoflow_engine::{EngineConfig, FlowDefinition, FlowEngine, Session};
use convoflow_tools::ToolDefinition;
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Read a JSON file holding either an array of definitions or one.
fn load_definitions<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))?;
    let definitions = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|one| vec![one]),
    }
    .with_context(|| format!("invalid definitions in {}", path.display()))?;
    Ok(definitions)
}

pub fn load_flows(path: &Path) -> Result<Vec<FlowDefinition>> {
    let flows = load_definitions(path)?;
    info!(path = %path.display(), "flows loaded");
    Ok(flows)
}

pub fn load_tools(path: Option<&Path>) -> Result<Vec<ToolDefinition>> {
    match path {
        Some(path) => load_definitions(path),
        None => Ok(Vec::new()),
    }
}

/// Load the engine configuration, applying a command-line locale override.
pub fn load_config(path: Option<&Path>, locale: Option<String>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(locale) = locale {
        config.locale = locale;
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Resume the session stored at `path`, or start a new one.
pub fn load_session(engine: &FlowEngine, path: Option<&Path>, user: &str) -> Result<Session> {
    if let Some(path) = path
        && path.exists()
    {
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let session =
            Session::from_json(&text).with_context(|| format!("{} is not a valid session", path.display()))?;
        info!(session_id = %session.id, frames = session.depth(), "session resumed");
        return Ok(session);
    }
    Ok(engine.init_session(user, uuid::Uuid::now_v7().to_string()))
}

pub fn save_session(path: &Path, session: &Session) -> Result<()> {
    let json = session.to_json().context("failed to serialize session")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
