//! The flow registry.
//!
//! Read-only after construction and cheap to clone.  Flows are addressable
//! by id and by name; ids take precedence when the two overlap.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::flow::FlowDefinition;

#[derive(Debug, Default)]
struct Inner {
    flows: Vec<Arc<FlowDefinition>>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

/// Immutable set of flow definitions.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    inner: Arc<Inner>,
}

impl FlowRegistry {
    /// Build a registry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for a duplicate flow id.  A duplicate
    /// name is only logged; the first flow keeps it.
    pub fn new(definitions: impl IntoIterator<Item = FlowDefinition>) -> Result<Self> {
        let mut inner = Inner::default();
        for mut definition in definitions {
            if definition.name.is_empty() {
                definition.name = definition.id.clone();
            }
            if inner.by_id.contains_key(&definition.id) {
                return Err(EngineError::Config {
                    reason: format!("duplicate flow id `{}`", definition.id),
                });
            }
            let index = inner.flows.len();
            inner.by_id.insert(definition.id.clone(), index);
            if inner.by_name.contains_key(&definition.name) {
                tracing::warn!(flow_id = %definition.id, name = %definition.name, "duplicate flow name ignored");
            } else {
                inner.by_name.insert(definition.name.clone(), index);
            }
            tracing::debug!(flow_id = %definition.id, steps = definition.steps.len(), "flow registered");
            inner.flows.push(Arc::new(definition));
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Parse a JSON array of flows (or a single flow object).
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let definitions: Vec<FlowDefinition> = match value {
            serde_json::Value::Array(_) => serde_json::from_value(value)?,
            other => vec![serde_json::from_value(other)?],
        };
        Self::new(definitions)
    }

    /// Look up a flow by id, then by name.
    pub fn get(&self, id_or_name: &str) -> Option<&Arc<FlowDefinition>> {
        self.inner
            .by_id
            .get(id_or_name)
            .or_else(|| self.inner.by_name.get(id_or_name))
            .map(|&i| &self.inner.flows[i])
    }

    pub fn contains(&self, id_or_name: &str) -> bool {
        self.get(id_or_name).is_some()
    }

    /// Flows in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FlowDefinition>> {
        self.inner.flows.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.flows.is_empty()
    }
}
