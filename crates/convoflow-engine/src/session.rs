//! Session and flow-frame model.
//!
//! A [`Session`] is plain data owned by the host.  It holds no handles, so
//! it survives any number of JSON round trips between turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use convoflow_expr::JsonMap;

use crate::flow::{FlowDefinition, StepDefinition, VariableScope};

// ═══════════════════════════════════════════════════════════════════════
//  Frames
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    /// Has steps to execute.
    #[default]
    Running,
    /// Suspended at a SAY-GET, waiting for the next user turn.
    AwaitingInput,
    Completed,
    Failed,
}

impl std::fmt::Display for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One activation of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFrame {
    pub flow_id: String,
    pub flow_name: String,
    pub version: String,
    /// Flow-local variables, in insertion order.
    pub variables: JsonMap,
    /// Remaining steps, next step last.
    steps: Vec<StepDefinition>,
    pub state: FrameState,
    /// Variable that receives the next user turn.
    pub pending_variable: Option<String>,
    /// The rendered prompt of the pending SAY-GET, re-emitted on resume.
    pub pending_prompt: Option<String>,
    /// Correlates tool calls and audit records of this frame.
    pub transaction_id: String,
    /// Set when another flow interrupted this one; cleared once the
    /// saved-progress notice has been shown.
    #[serde(default)]
    pub progress_saved: bool,
    /// Caller variable that receives this frame's RETURN value.
    #[serde(default)]
    pub return_variable: Option<String>,
}

impl FlowFrame {
    /// A fresh frame for `flow`, with declared flow-scope variables
    /// initialized and `args` bound over them.
    pub fn new(flow: &FlowDefinition, args: JsonMap) -> Self {
        let mut variables = JsonMap::new();
        for spec in &flow.variables {
            if spec.scope == VariableScope::Flow {
                variables.insert(spec.name.clone(), spec.value.clone());
            }
        }
        variables.extend(args);
        Self {
            flow_id: flow.id.clone(),
            flow_name: flow.display_name().to_string(),
            version: flow.version.clone(),
            variables,
            steps: flow.steps.iter().rev().cloned().collect(),
            state: FrameState::Running,
            pending_variable: None,
            pending_prompt: None,
            transaction_id: Uuid::now_v7().to_string(),
            progress_saved: false,
            return_variable: None,
        }
    }

    pub fn with_return_variable(mut self, variable: Option<String>) -> Self {
        self.return_variable = variable;
        self
    }

    /// Take the next step to execute.
    pub fn next_step(&mut self) -> Option<StepDefinition> {
        self.steps.pop()
    }

    /// Schedule `step` to run before the remaining steps.
    pub fn push_step(&mut self, step: StepDefinition) {
        self.steps.push(step);
    }

    /// Remaining steps, next first.
    pub fn remaining_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().rev()
    }

    pub fn remaining_count(&self) -> usize {
        self.steps.len()
    }

    /// Drop every remaining step.
    pub fn discard_remaining(&mut self) {
        self.steps.clear();
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.state == FrameState::AwaitingInput
    }

    /// Suspend at a prompt.
    pub fn await_input(&mut self, variable: &str, prompt: String) {
        self.state = FrameState::AwaitingInput;
        self.pending_variable = Some(variable.to_string());
        self.pending_prompt = Some(prompt);
    }

    /// Bind a user reply to the pending variable and resume.
    ///
    /// Returns `false` when the frame was not waiting for input.
    pub fn accept_input(&mut self, content: &str) -> bool {
        if !self.is_awaiting_input() {
            return false;
        }
        if let Some(variable) = self.pending_variable.take() {
            self.variables
                .insert(variable, serde_json::Value::String(content.to_string()));
        }
        self.pending_prompt = None;
        self.progress_saved = false;
        self.state = FrameState::Running;
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// Per-conversation state, handed back and forth between host and engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Active frames, top of stack last.  Empty between flows.
    pub flow_stack: Vec<FlowFrame>,
    /// Free-form host data (caller id, channel, locale, ...).
    pub cargo: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: session_id.into(),
            user_id: user_id.into(),
            flow_stack: Vec::new(),
            cargo: JsonMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a cargo entry.
    pub fn with_cargo(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.cargo.insert(key.into(), value);
        self
    }

    /// The active frame.
    pub fn active(&self) -> Option<&FlowFrame> {
        self.flow_stack.last()
    }

    pub fn active_mut(&mut self) -> Option<&mut FlowFrame> {
        self.flow_stack.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.flow_stack.len()
    }

    /// No flow in progress.
    pub fn is_idle(&self) -> bool {
        self.flow_stack.is_empty()
    }

    /// Whether the active frame is waiting for a user reply.
    pub fn is_awaiting_input(&self) -> bool {
        self.active().is_some_and(FlowFrame::is_awaiting_input)
    }

    /// How many frames of `flow_id` are on the stack.
    pub fn occurrences(&self, flow_id: &str) -> usize {
        self.flow_stack.iter().filter(|f| f.flow_id == flow_id).count()
    }

    /// The active chain of flow ids, bottom first.
    pub fn chain(&self) -> Vec<&str> {
        self.flow_stack.iter().map(|f| f.flow_id.as_str()).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow() -> FlowDefinition {
        serde_json::from_value(json!({
            "id": "f",
            "name": "demo",
            "variables": [
                {"name": "count", "value": 0},
                {"name": "shared", "scope": "session", "value": true}
            ],
            "steps": [
                {"type": "SAY", "value": "one"},
                {"type": "SAY", "value": "two"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn new_frame_initializes_variables_and_cursor() {
        let args = json!({"count": 5}).as_object().cloned().unwrap();
        let mut frame = FlowFrame::new(&flow(), args);
        assert_eq!(frame.variables.get("count"), Some(&json!(5)));
        assert!(!frame.variables.contains_key("shared"));
        assert_eq!(frame.remaining_count(), 2);
        assert_eq!(frame.next_step().unwrap(), serde_json::from_value(json!({"type": "SAY", "value": "one"})).unwrap());
        assert_eq!(frame.remaining_count(), 1);
        assert!(!frame.transaction_id.is_empty());
    }

    #[test]
    fn input_binds_pending_variable() {
        let mut frame = FlowFrame::new(&flow(), JsonMap::new());
        assert!(!frame.accept_input("ignored"));
        frame.await_input("answer", "Question?".into());
        frame.progress_saved = true;
        assert!(frame.accept_input("42"));
        assert_eq!(frame.variables.get("answer"), Some(&json!("42")));
        assert_eq!(frame.state, FrameState::Running);
        assert!(frame.pending_prompt.is_none());
        assert!(!frame.progress_saved);
    }

    #[test]
    fn session_round_trips_through_json() {
        let mut session = Session::new("u1", "s1").with_cargo("channel", json!("voice"));
        let mut frame = FlowFrame::new(&flow(), JsonMap::new());
        frame.await_input("answer", "Question?".into());
        session.flow_stack.push(frame);

        let decoded = Session::from_json(&session.to_json().unwrap()).unwrap();
        assert_eq!(decoded, session);
        assert!(decoded.is_awaiting_input());
        assert_eq!(decoded.chain(), ["f"]);
    }
}
