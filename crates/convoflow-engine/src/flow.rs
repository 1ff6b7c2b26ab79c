//! Flow and step definitions.
//!
//! Flows are plain serde data loaded by the host, usually from JSON:
//!
//! ```json
//! {
//!   "id": "order-status",
//!   "name": "order_status",
//!   "metadata": {"triggers": ["where is my order"]},
//!   "steps": [
//!     {"type": "SAY-GET", "value": "What is your order number?", "variable": "orderId"},
//!     {"type": "CALL-TOOL", "tool": "lookup_order", "variable": "order"},
//!     {"type": "SAY", "value": {"en": "Status: {{order.status}}", "es": "Estado: {{order.status}}"}}
//!   ]
//! }
//! ```
//!
//! Every step kind is one variant of [`StepDefinition`], tagged by `type`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use convoflow_expr::JsonMap;

/// Branch key that matches when nothing else does.
pub const DEFAULT_BRANCH: &str = "default";

/// Prefix of CASE branch keys.
pub const CONDITION_PREFIX: &str = "condition:";

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// A template, either shared by all locales or given per locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedText {
    Plain(String),
    Localized(IndexMap<String, String>),
}

impl LocalizedText {
    /// Pick the text for `locale`.
    ///
    /// Tries the exact locale (`es-MX`), then its language (`es`), then
    /// English, then the first entry.
    pub fn resolve(&self, locale: &str) -> &str {
        let map = match self {
            Self::Plain(text) => return text,
            Self::Localized(map) => map,
        };
        let language = locale.split(['-', '_']).next().unwrap_or(locale);
        map.get(locale)
            .or_else(|| map.get(language))
            .or_else(|| map.get("en"))
            .or_else(|| map.values().next())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// All variants, for static checks.
    pub fn variants(&self) -> Vec<&str> {
        match self {
            Self::Plain(text) => vec![text.as_str()],
            Self::Localized(map) => map.values().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for LocalizedText {
    fn from(text: &str) -> Self {
        Self::Plain(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// How a FLOW step (or an `onFail` handler) attaches the target flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Push on top; the caller continues when the callee completes.
    #[default]
    Call,
    /// Discard the caller's remaining steps and take its place.
    Replace,
    /// Clear the whole stack, then push.
    Reboot,
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Replace => write!(f, "replace"),
            Self::Reboot => write!(f, "reboot"),
        }
    }
}

/// One unit of flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepDefinition {
    #[serde(rename = "SAY")]
    Say(SayStep),
    #[serde(rename = "SAY-GET")]
    SayGet(SayGetStep),
    #[serde(rename = "SET")]
    Set(SetStep),
    #[serde(rename = "CALL-TOOL")]
    CallTool(CallToolStep),
    #[serde(rename = "FLOW")]
    Flow(FlowStep),
    #[serde(rename = "SWITCH")]
    Switch(SwitchStep),
    #[serde(rename = "CASE")]
    Case(CaseStep),
    #[serde(rename = "RETURN")]
    Return(ReturnStep),
}

/// Emit text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SayStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "text")]
    pub value: LocalizedText,
}

/// Emit a prompt and wait for the next user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SayGetStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "text")]
    pub value: LocalizedText,
    pub variable: String,
}

/// Assign a flow variable.
///
/// `value` is JSON whose strings may contain `{{...}}` tokens; strings
/// without tokens are literal.  `expression` is evaluated as code instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub variable: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool: String,
    /// Argument templates.  Inferred from the scope when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<Box<StepDefinition>>,
}

/// Start another flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target flow id or name.
    #[serde(alias = "flow")]
    pub name: String,
    #[serde(default)]
    pub call_type: CallType,
    /// Templates evaluated in the caller's scope and bound in the callee.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub args: JsonMap,
    /// Caller variable receiving the callee's RETURN value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

/// Branch on the exact string value of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// A variable path (`choice`, `order.status`) or a template.
    pub variable: String,
    pub branches: IndexMap<String, StepDefinition>,
}

/// Branch on the first truthy `condition:` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub branches: IndexMap<String, StepDefinition>,
}

/// End the frame with a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl StepDefinition {
    /// The step's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Say(_) => "SAY",
            Self::SayGet(_) => "SAY-GET",
            Self::Set(_) => "SET",
            Self::CallTool(_) => "CALL-TOOL",
            Self::Flow(_) => "FLOW",
            Self::Switch(_) => "SWITCH",
            Self::Case(_) => "CASE",
            Self::Return(_) => "RETURN",
        }
    }

    /// The optional author-supplied step id.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Say(s) => s.id.as_deref(),
            Self::SayGet(s) => s.id.as_deref(),
            Self::Set(s) => s.id.as_deref(),
            Self::CallTool(s) => s.id.as_deref(),
            Self::Flow(s) => s.id.as_deref(),
            Self::Switch(s) => s.id.as_deref(),
            Self::Case(s) => s.id.as_deref(),
            Self::Return(s) => s.id.as_deref(),
        }
    }

    /// A short label for logs and diagnostics: the id, or the kind.
    pub fn label(&self) -> String {
        match self.id() {
            Some(id) => format!("{} `{id}`", self.kind()),
            None => self.kind().to_string(),
        }
    }

    /// Steps nested directly inside this one (branches and `onFail`).
    pub fn children(&self) -> Vec<(String, &StepDefinition)> {
        match self {
            Self::Switch(s) => s.branches.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Self::Case(s) => s.branches.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Self::CallTool(s) => s
                .on_fail
                .as_deref()
                .map(|h| vec![("onFail".to_string(), h)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Where a declared variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    /// Initialized in every new frame of the flow.
    #[default]
    Flow,
    /// Initialized once in the session cargo, if not already present.
    Session,
}

/// A declared variable with its initial value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default, alias = "initial")]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Descriptive data about a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowMetadata {
    pub description: Option<String>,
    pub risk_level: RiskLevel,
    /// Log every start and completion of this flow at info level.
    pub audit: bool,
    /// Phrases that start the flow when they appear in a user turn.
    pub triggers: Vec<String>,
}

/// A named, versioned sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    /// Defaults to the id.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub metadata: FlowMetadata,
}

fn default_version() -> String {
    "1.0.0".into()
}

impl FlowDefinition {
    /// The display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_step_kind() {
        let steps: Vec<StepDefinition> = serde_json::from_value(json!([
            {"type": "SAY", "value": "hi"},
            {"type": "SAY-GET", "value": {"en": "Name?", "es": "¿Nombre?"}, "variable": "name"},
            {"type": "SET", "variable": "n", "value": 1},
            {"type": "CALL-TOOL", "tool": "t", "variable": "r",
             "onFail": {"type": "SAY", "value": "oops"}},
            {"type": "FLOW", "name": "other", "callType": "replace", "args": {"a": "{{n}}"}},
            {"type": "SWITCH", "variable": "n", "branches": {"1": {"type": "SAY", "value": "one"}}},
            {"type": "CASE", "branches": {
                "condition:n > 1": {"type": "SAY", "value": "big"},
                "default": {"type": "SAY", "value": "small"}
            }},
            {"type": "RETURN", "value": "{{n}}"}
        ]))
        .unwrap();
        let kinds: Vec<_> = steps.iter().map(StepDefinition::kind).collect();
        assert_eq!(
            kinds,
            ["SAY", "SAY-GET", "SET", "CALL-TOOL", "FLOW", "SWITCH", "CASE", "RETURN"]
        );
        match &steps[4] {
            StepDefinition::Flow(f) => assert_eq!(f.call_type, CallType::Replace),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(steps[3].children().len(), 1);
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let result: Result<StepDefinition, _> = serde_json::from_value(json!({"type": "EVAL", "value": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn case_branches_keep_declaration_order() {
        let step: StepDefinition = serde_json::from_value(json!({
            "type": "CASE",
            "branches": {
                "condition:b": {"type": "SAY", "value": "b"},
                "condition:a": {"type": "SAY", "value": "a"},
                "default": {"type": "SAY", "value": "d"}
            }
        }))
        .unwrap();
        let keys: Vec<_> = step.children().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["condition:b", "condition:a", "default"]);
    }

    #[test]
    fn localized_text_fallbacks() {
        let text: LocalizedText = serde_json::from_value(json!({"en": "Hello", "es": "Hola"})).unwrap();
        assert_eq!(text.resolve("es-MX"), "Hola");
        assert_eq!(text.resolve("fr"), "Hello");
        assert_eq!(LocalizedText::from("x").resolve("es"), "x");
    }

    #[test]
    fn flow_defaults() {
        let flow: FlowDefinition = serde_json::from_value(json!({"id": "f", "steps": []})).unwrap();
        assert_eq!(flow.display_name(), "f");
        assert_eq!(flow.version, "1.0.0");
        assert_eq!(flow.metadata.risk_level, RiskLevel::Low);
    }
}
