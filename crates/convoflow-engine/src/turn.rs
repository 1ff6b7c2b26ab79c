//! Turn input and activity output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

/// One message from the host.  Only user turns drive flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// A flow chosen by the host, bypassing intent detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl Turn {
    /// A user turn stamped now.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            intent: None,
        }
    }

    /// Start `flow` (id or name) regardless of what the content says.
    pub fn with_intent(mut self, flow: impl Into<String>) -> Self {
        self.intent = Some(flow.into());
        self
    }
}

/// Result of one `update_activity` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    /// Everything the flows said this turn, one message per line.
    pub response: String,
    /// The session to hand back on the next turn.
    pub session: Session,
}
