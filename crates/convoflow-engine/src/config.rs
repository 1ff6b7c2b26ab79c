//! Engine configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! locale = "es"
//! security_level = "strict"
//! max_steps_per_turn = 200
//! recovery_flow = "apology"
//!
//! [retry]
//! max_retries = 3
//!
//! [control_commands]
//! cancel = ["cancel", "cancelar", "stop"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use convoflow_expr::SecurityLevel;
use convoflow_tools::RetryConfig;

use crate::error::{EngineError, Result};

/// Runtime limits and behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Locale used for step text and engine messages, unless the session
    /// cargo carries a `locale` entry.
    pub locale: String,
    pub security_level: SecurityLevel,
    /// Steps a single turn may execute before the turn is aborted.
    pub max_steps_per_turn: usize,
    /// Maximum number of frames on a flow stack.
    pub max_stack_depth: usize,
    /// How many frames of the same flow may be active at once.
    pub max_flow_recursion: usize,
    /// Flow started with `reboot` semantics after a structural error.
    pub recovery_flow: Option<String>,
    /// Let a new intent interrupt a flow that is waiting for input.
    pub detect_interruptions: bool,
    /// Classifier replies below this confidence are ignored.
    pub min_intent_confidence: f64,
    pub retry: RetryConfig,
    pub control_commands: ControlCommands,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            locale: "en".into(),
            security_level: SecurityLevel::default(),
            max_steps_per_turn: 500,
            max_stack_depth: 16,
            max_flow_recursion: 4,
            recovery_flow: None,
            detect_interruptions: true,
            min_intent_confidence: 0.5,
            retry: RetryConfig::default(),
            control_commands: ControlCommands::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config {
            reason: format!("invalid engine config: {e}"),
        })?;
        config.check()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    fn check(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(EngineError::Config {
                reason: reason.to_string(),
            })
        };
        if self.max_steps_per_turn == 0 {
            return invalid("max_steps_per_turn must be positive");
        }
        if self.max_stack_depth == 0 {
            return invalid("max_stack_depth must be positive");
        }
        if self.max_flow_recursion == 0 {
            return invalid("max_flow_recursion must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_intent_confidence) {
            return invalid("min_intent_confidence must be between 0 and 1");
        }
        if let Err(reason) = self.retry.check() {
            return invalid(&format!("invalid retry settings: {reason}"));
        }
        Ok(())
    }
}

/// Keywords for the out-of-band commands, matched against the whole
/// trimmed, lower-cased turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCommands {
    pub cancel: Vec<String>,
    pub help: Vec<String>,
    pub status: Vec<String>,
}

impl Default for ControlCommands {
    fn default() -> Self {
        let words = |w: &[&str]| w.iter().map(|s| s.to_string()).collect();
        Self {
            cancel: words(&["cancel", "stop", "quit", "cancelar"]),
            help: words(&["help", "ayuda"]),
            status: words(&["status", "where am i", "estado"]),
        }
    }
}

/// An out-of-band command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Cancel,
    Help,
    Status,
}

impl ControlCommands {
    /// Recognize a control command.
    pub fn recognize(&self, text: &str) -> Option<ControlCommand> {
        let text = text.trim().to_lowercase();
        let hit = |list: &[String]| list.iter().any(|w| w.to_lowercase() == text);
        if hit(&self.cancel) {
            Some(ControlCommand::Cancel)
        } else if hit(&self.help) {
            Some(ControlCommand::Help)
        } else if hit(&self.status) {
            Some(ControlCommand::Status)
        } else {
            None
        }
    }
}
