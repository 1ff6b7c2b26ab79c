//! Tool definitions and the tool registry.
//!
//! Definitions are plain serde data, loaded from JSON by the host:
//!
//! ```json
//! {
//!   "id": "lookup_order",
//!   "description": "Fetch an order by number",
//!   "parameters": {
//!     "type": "object",
//!     "properties": { "orderId": { "type": "string", "pattern": "^[0-9]+$" } },
//!     "required": ["orderId"]
//!   },
//!   "implementation": {
//!     "type": "http",
//!     "url": "https://api.example.com/orders/{orderId}",
//!     "method": "GET"
//!   },
//!   "responseMapping": { "type": "jsonPath", "path": "$.order.status" },
//!   "security": { "rateLimit": { "requests": 10, "window": 60000 } }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolError};
use crate::mapping::ResponseMapping;
use crate::schema::ParameterSchema;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// A declared tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema (draft 7) for the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
    pub implementation: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<ResponseMapping>,
    #[serde(default)]
    pub security: SecurityPolicy,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// How a tool is executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Implementation {
    /// A host capability looked up by name.
    Local { capability: String },
    /// An HTTP endpoint.
    Http(HttpDescriptor),
    /// A canned payload.  String leaves may be templates over the arguments.
    Mock { payload: serde_json::Value },
}

/// HTTP call descriptor.  Every string value is a `{{...}}` template
/// evaluated with the arguments in scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDescriptor {
    /// URL template.  `{name}` placeholders are path parameters.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path-parameter values by placeholder name.  A placeholder without an
    /// entry takes the argument of the same name.
    #[serde(default)]
    pub path_params: IndexMap<String, String>,
    #[serde(default)]
    pub query_params: IndexMap<String, String>,
    /// Raw query string appended after `queryParams`.
    #[serde(default)]
    pub custom_query: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry budget for recoverable failures.  Falls back to the invoker's
    /// configured default.
    #[serde(default)]
    pub retries: Option<u32>,
}

fn default_method() -> String {
    "GET".into()
}

/// Security block of a tool definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub audit_level: AuditLevel,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
}

/// How much of an invocation is written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    #[default]
    None,
    /// Tool id, outcome and timing.
    Basic,
    /// Also the evaluated arguments.
    Full,
}

/// Sliding-window quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub requests: u32,
    #[serde(alias = "window")]
    pub window_ms: u64,
    #[serde(default)]
    pub scope: RateLimitScope,
}

/// What the quota is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    #[default]
    Global,
    Session,
    User,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A definition paired with its compiled parameter schema.
#[derive(Debug)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub schema: ParameterSchema,
}

/// Immutable tool registry keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Build a registry, compiling every parameter schema.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Definition`] for a duplicate id or a schema that
    /// does not compile.
    pub fn new(definitions: impl IntoIterator<Item = ToolDefinition>) -> Result<Self> {
        let mut tools = HashMap::new();
        for definition in definitions {
            if tools.contains_key(&definition.id) {
                return Err(ToolError::Definition {
                    tool_id: definition.id,
                    reason: "duplicate tool id".into(),
                });
            }
            let schema = ParameterSchema::compile(&definition.id, &definition.parameters)?;
            tracing::debug!(tool = %definition.id, "tool registered");
            tools.insert(
                definition.id.clone(),
                RegisteredTool { definition, schema },
            );
        }
        Ok(Self {
            tools: Arc::new(tools),
        })
    }

    /// Parse a JSON array of definitions and build a registry.
    pub fn from_json(json: &str) -> Result<Self> {
        let definitions: Vec<ToolDefinition> =
            serde_json::from_str(json).map_err(|e| ToolError::Definition {
                tool_id: "<file>".into(),
                reason: e.to_string(),
            })?;
        Self::new(definitions)
    }

    pub fn get(&self, tool_id: &str) -> Option<&RegisteredTool> {
        self.tools.get(tool_id)
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    /// All tool ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
