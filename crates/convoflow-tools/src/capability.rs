//! Host capabilities backing `local` tools.
//!
//! A capability is looked up by the name declared in the tool definition.
//! There is no string-to-code path: a name either resolves to a registered
//! [`Capability`] or the call fails with
//! [`ToolError::CapabilityMissing`](crate::ToolError::CapabilityMissing).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// Per-call identity passed to capabilities and used for rate-limit scopes
/// and audit records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub session_id: String,
    pub user_id: Option<String>,
    /// Correlates every tool call made by one flow frame.
    pub transaction_id: Option<String>,
}

impl InvocationContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// A host-provided function callable from a `local` tool.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Execute with validated arguments.
    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &InvocationContext,
    ) -> std::result::Result<serde_json::Value, CapabilityError>;
}

/// Adapts a synchronous closure into a [`Capability`].
pub struct FnCapability<F>(pub F);

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(serde_json::Value) -> std::result::Result<serde_json::Value, CapabilityError> + Send + Sync,
{
    async fn call(
        &self,
        args: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> std::result::Result<serde_json::Value, CapabilityError> {
        (self.0)(args)
    }
}

/// Named capabilities, fixed at engine construction.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("CapabilityTable").field("entries", &names).finish()
    }
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        let name = name.into();
        tracing::debug!(capability = %name, "capability registered");
        self.entries.insert(name, capability);
    }

    /// Builder-style registration.
    pub fn with(mut self, name: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        self.register(name, capability);
        self
    }

    /// Builder-style registration of a synchronous closure.
    pub fn with_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> std::result::Result<serde_json::Value, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        self.with(name, Arc::new(FnCapability(f)))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
