//! The step interpreter.
//!
//! [`StepInterpreter::execute`] runs one [`StepDefinition`] against the
//! active [`FlowFrame`] and reports what the controller should do next as a
//! [`StepOutcome`].  It never touches the flow stack: FLOW steps come back
//! as [`StepOutcome::Transfer`] and frame completion as
//! [`StepOutcome::Terminate`].
//!
//! Branch steps (SWITCH, CASE) and `onFail` handlers push their single
//! chosen step onto the frame, so it runs next.

use convoflow_expr::{Evaluator, JsonMap, Scope, Value, template};
use convoflow_tools::{FailureClass, InvocationContext, ToolError, ToolInvoker};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::flow::{
    CONDITION_PREFIX, CallToolStep, CallType, CaseStep, DEFAULT_BRANCH, FlowStep, SetStep, StepDefinition,
    SwitchStep,
};
use crate::messages::{Messages, keys};
use crate::session::FlowFrame;

/// Name of the frame variable describing the last failed tool call, visible
/// to `onFail` handlers.
pub const LAST_ERROR_VARIABLE: &str = "lastError";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A request to attach another flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    /// Target flow id or name.
    pub flow: String,
    pub call_type: CallType,
    /// Evaluated arguments bound in the new frame.
    pub args: JsonMap,
    /// Caller variable receiving the callee's RETURN value.
    pub variable: Option<String>,
}

/// What the controller does after a step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Run the frame's next step.
    Continue,
    /// The frame waits for the next user turn.
    Suspend { variable: String },
    /// The frame ends now, with an optional return value.
    Terminate(Option<serde_json::Value>),
    /// A tool failed without a handler.  The frame and every caller
    /// waiting on it end; an interrupted frame below them resumes.
    Cancel,
    /// A structural failure; the controller starts recovery.
    Fail(EngineError),
    /// Attach another flow (FLOW step).
    Transfer(Transfer),
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Everything a step can read besides the frame itself.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub evaluator: &'a Evaluator,
    pub invoker: &'a ToolInvoker,
    pub messages: &'a Messages,
    pub globals: &'a JsonMap,
    pub locale: &'a str,
    pub session_id: &'a str,
    pub user_id: &'a str,
}

/// Executes steps.
#[derive(Debug, Clone, Copy)]
pub struct StepInterpreter<'a> {
    ctx: StepContext<'a>,
}

impl<'a> StepInterpreter<'a> {
    pub fn new(ctx: StepContext<'a>) -> Self {
        Self { ctx }
    }

    fn scope<'s>(&self, frame: &'s FlowFrame, cargo: &'s JsonMap) -> Scope<'s>
    where
        'a: 's,
    {
        Scope::new()
            .with_locals(&frame.variables)
            .with_globals(self.ctx.globals)
            .with_cargo(cargo)
    }

    /// Execute `step`.  Text produced by the step is appended to `output`.
    pub async fn execute(
        &self,
        step: &StepDefinition,
        frame: &mut FlowFrame,
        cargo: &JsonMap,
        output: &mut Vec<String>,
    ) -> StepOutcome {
        debug!(flow_id = %frame.flow_id, step = %step.label(), "executing step");
        match step {
            StepDefinition::Say(say) => {
                let text = self.render(say.value.resolve(self.ctx.locale), frame, cargo);
                if !text.is_empty() {
                    output.push(text);
                }
                StepOutcome::Continue
            }
            StepDefinition::SayGet(ask) => {
                let prompt = self.render(ask.value.resolve(self.ctx.locale), frame, cargo);
                if !prompt.is_empty() {
                    output.push(prompt.clone());
                }
                frame.await_input(&ask.variable, prompt);
                StepOutcome::Suspend {
                    variable: ask.variable.clone(),
                }
            }
            StepDefinition::Set(set) => {
                let value = self.set_value(set, frame, cargo);
                frame.variables.insert(set.variable.clone(), value);
                StepOutcome::Continue
            }
            StepDefinition::CallTool(call) => self.call_tool(call, frame, cargo, output).await,
            StepDefinition::Flow(flow) => self.transfer(flow, frame, cargo),
            StepDefinition::Switch(switch) => self.switch(step, switch, frame, cargo),
            StepDefinition::Case(case) => self.case(step, case, frame, cargo),
            StepDefinition::Return(ret) => {
                let value = match &ret.value {
                    None => None,
                    Some(raw) => {
                        let scope = self.scope(frame, cargo);
                        Some(self.ctx.evaluator.evaluate_json(raw, &scope).map_or_else(
                            |e| {
                                warn!(flow_id = %frame.flow_id, error = %e, "RETURN value failed to evaluate");
                                placeholder(raw)
                            },
                            |v| v.to_json(),
                        ))
                    }
                };
                frame.discard_remaining();
                StepOutcome::Terminate(value)
            }
        }
    }

    fn render(&self, text: &str, frame: &FlowFrame, cargo: &JsonMap) -> String {
        self.ctx.evaluator.render_lenient(text, &self.scope(frame, cargo))
    }

    /// Evaluate a SET value; failures degrade to the visible source text.
    fn set_value(&self, set: &SetStep, frame: &FlowFrame, cargo: &JsonMap) -> serde_json::Value {
        let scope = self.scope(frame, cargo);
        let result = match &set.expression {
            Some(expression) => self.ctx.evaluator.evaluate(expression, &scope),
            None => self.ctx.evaluator.evaluate_json(&set.value, &scope),
        };
        match result {
            Ok(value) => value.to_json(),
            Err(e) => {
                warn!(flow_id = %frame.flow_id, variable = %set.variable, error = %e, "SET value failed to evaluate");
                match &set.expression {
                    Some(expression) => serde_json::Value::String(expression.clone()),
                    None => placeholder(&set.value),
                }
            }
        }
    }

    async fn call_tool(
        &self,
        call: &CallToolStep,
        frame: &mut FlowFrame,
        cargo: &JsonMap,
        output: &mut Vec<String>,
    ) -> StepOutcome {
        let mut ctx = InvocationContext::new(self.ctx.session_id).with_transaction(frame.transaction_id.clone());
        if !self.ctx.user_id.is_empty() {
            ctx = ctx.with_user(self.ctx.user_id);
        }
        let result = {
            let scope = self.scope(frame, cargo);
            self.ctx
                .invoker
                .invoke(&call.tool, call.args.as_ref(), &scope, &ctx)
                .await
        };
        match result {
            Ok(value) => {
                if let Some(variable) = &call.variable {
                    frame.variables.insert(variable.clone(), value);
                }
                StepOutcome::Continue
            }
            Err(error) => {
                frame.variables.insert(
                    LAST_ERROR_VARIABLE.to_string(),
                    serde_json::json!({
                        "tool": call.tool,
                        "class": error.class().to_string(),
                        "message": error.to_string(),
                    }),
                );
                match &call.on_fail {
                    Some(handler) => {
                        info!(
                            flow_id = %frame.flow_id,
                            tool = %call.tool,
                            class = %error.class(),
                            handler = %handler.label(),
                            "tool failed, running onFail handler"
                        );
                        frame.push_step((**handler).clone());
                        StepOutcome::Continue
                    }
                    None => {
                        warn!(
                            flow_id = %frame.flow_id,
                            tool = %call.tool,
                            class = %error.class(),
                            error = %error,
                            "tool failed, cancelling flow"
                        );
                        output.push(self.ctx.messages.get(self.ctx.locale, failure_message(&error)));
                        frame.discard_remaining();
                        StepOutcome::Cancel
                    }
                }
            }
        }
    }

    fn transfer(&self, flow: &FlowStep, frame: &FlowFrame, cargo: &JsonMap) -> StepOutcome {
        let scope = self.scope(frame, cargo);
        let mut args = JsonMap::with_capacity(flow.args.len());
        for (name, raw) in &flow.args {
            match self.ctx.evaluator.evaluate_json(raw, &scope) {
                Ok(value) => {
                    args.insert(name.clone(), value.to_json());
                }
                Err(e) => return StepOutcome::Fail(EngineError::Expression(e)),
            }
        }
        StepOutcome::Transfer(Transfer {
            flow: flow.name.clone(),
            call_type: flow.call_type,
            args,
            variable: flow.variable.clone(),
        })
    }

    fn switch(&self, step: &StepDefinition, switch: &SwitchStep, frame: &mut FlowFrame, cargo: &JsonMap) -> StepOutcome {
        let key = {
            let scope = self.scope(frame, cargo);
            match self.selector(&switch.variable, &scope) {
                Ok(value) => value.display(),
                Err(e) => return StepOutcome::Fail(EngineError::Expression(e)),
            }
        };
        let branch = switch
            .branches
            .iter()
            .find(|(k, _)| k.as_str() != DEFAULT_BRANCH && **k == key)
            .or_else(|| switch.branches.get_key_value(DEFAULT_BRANCH));
        match branch {
            Some((matched, next)) => {
                debug!(flow_id = %frame.flow_id, key = %key, branch = %matched, "SWITCH branch taken");
                frame.push_step(next.clone());
                StepOutcome::Continue
            }
            None => StepOutcome::Fail(EngineError::BranchNotMatched {
                flow: frame.flow_id.clone(),
                step: step.label(),
                value: key,
            }),
        }
    }

    /// Resolve a SWITCH selector: a template, a variable path or an
    /// expression.
    fn selector(&self, selector: &str, scope: &Scope<'_>) -> convoflow_expr::Result<Value> {
        if template::has_tokens(selector) {
            return self.ctx.evaluator.evaluate(selector, scope);
        }
        match template::parse_path(selector.trim()) {
            Some(path) => template::resolve(&path, scope),
            None => self.ctx.evaluator.evaluate_expression(selector, scope),
        }
    }

    fn case(&self, step: &StepDefinition, case: &CaseStep, frame: &mut FlowFrame, cargo: &JsonMap) -> StepOutcome {
        let chosen = {
            let scope = self.scope(frame, cargo);
            case.branches
                .iter()
                .filter(|(k, _)| k.as_str() != DEFAULT_BRANCH)
                .find(|(key, _)| {
                    let condition = key.strip_prefix(CONDITION_PREFIX).unwrap_or(key.as_str());
                    match self.ctx.evaluator.evaluate_condition(condition, &scope) {
                        Ok(truthy) => truthy,
                        Err(e) => {
                            warn!(flow_id = %frame.flow_id, condition, error = %e, "CASE condition failed, treated as false");
                            false
                        }
                    }
                })
                .or_else(|| case.branches.get_key_value(DEFAULT_BRANCH))
                .map(|(k, v)| (k.clone(), v.clone()))
        };
        match chosen {
            Some((key, next)) => {
                debug!(flow_id = %frame.flow_id, branch = %key, "CASE branch taken");
                frame.push_step(next);
                StepOutcome::Continue
            }
            None => StepOutcome::Fail(EngineError::BranchNotMatched {
                flow: frame.flow_id.clone(),
                step: step.label(),
                value: "no true condition".into(),
            }),
        }
    }
}

/// The localized message for a tool failure without an `onFail` handler.
pub fn failure_message(error: &ToolError) -> &'static str {
    match error {
        ToolError::RateLimited { .. } => keys::TOOL_RATE_LIMITED,
        ToolError::AuthRequired { .. } => keys::TOOL_AUTH_REQUIRED,
        other => match other.class() {
            FailureClass::Recoverable => keys::TOOL_RECOVERABLE,
            FailureClass::Unrecoverable => keys::TOOL_UNRECOVERABLE,
            FailureClass::Generic => keys::TOOL_GENERIC,
        },
    }
}

/// What a failed template leaves behind: the source string, or null.
fn placeholder(raw: &serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) => serde_json::Value::String(s.clone()),
        _ => serde_json::Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowDefinition;
    use convoflow_tools::{CapabilityTable, RetryConfig, ToolRegistry};
    use serde_json::json;

    struct Fixture {
        evaluator: Evaluator,
        invoker: ToolInvoker,
        messages: Messages,
        globals: JsonMap,
    }

    impl Fixture {
        fn new(tools: serde_json::Value) -> Self {
            let evaluator = Evaluator::default();
            let registry = ToolRegistry::from_json(&tools.to_string()).unwrap();
            let invoker = ToolInvoker::new(registry, CapabilityTable::new(), evaluator.clone())
                .with_retry(RetryConfig::immediate(0));
            Self {
                evaluator,
                invoker,
                messages: Messages::builtin(),
                globals: json!({"brand": "Acme"}).as_object().cloned().unwrap(),
            }
        }

        fn interpreter(&self) -> StepInterpreter<'_> {
            StepInterpreter::new(StepContext {
                evaluator: &self.evaluator,
                invoker: &self.invoker,
                messages: &self.messages,
                globals: &self.globals,
                locale: "en",
                session_id: "s1",
                user_id: "u1",
            })
        }
    }

    fn frame(vars: serde_json::Value) -> FlowFrame {
        let flow: FlowDefinition = serde_json::from_value(json!({"id": "f", "steps": []})).unwrap();
        FlowFrame::new(&flow, vars.as_object().cloned().unwrap_or_default())
    }

    fn step(v: serde_json::Value) -> StepDefinition {
        serde_json::from_value(v).unwrap()
    }

    async fn run(fx: &Fixture, s: &StepDefinition, frame: &mut FlowFrame) -> (StepOutcome, Vec<String>) {
        let mut out = Vec::new();
        let outcome = fx.interpreter().execute(s, frame, &JsonMap::new(), &mut out).await;
        (outcome, out)
    }

    fn switch_step(with_default: bool) -> StepDefinition {
        let mut branches = json!({"1": {"type": "SAY", "value": "A"}});
        if with_default {
            branches["default"] = json!({"type": "SAY", "value": "D"});
        }
        step(json!({"type": "SWITCH", "variable": "choice", "branches": branches}))
    }

    /// Run a branch step, then the step it scheduled.
    async fn branch_output(fx: &Fixture, s: &StepDefinition, vars: serde_json::Value) -> Result<Vec<String>, EngineError> {
        let mut f = frame(vars);
        match run(fx, s, &mut f).await.0 {
            StepOutcome::Continue => {}
            StepOutcome::Fail(e) => return Err(e),
            other => panic!("unexpected {other:?}"),
        }
        let next = f.next_step().unwrap();
        Ok(run(fx, &next, &mut f).await.1)
    }

    #[tokio::test]
    async fn say_and_set() {
        let fx = Fixture::new(json!([]));
        let mut f = frame(json!({"name": "Ada"}));
        let (_, out) = run(&fx, &step(json!({"type": "SAY", "value": "Hi {{name}} from {{brand}}"})), &mut f).await;
        assert_eq!(out, ["Hi Ada from Acme"]);

        run(&fx, &step(json!({"type": "SET", "variable": "n", "value": "{{ 2 * 21 }}"})), &mut f).await;
        run(&fx, &step(json!({"type": "SET", "variable": "label", "value": "plain text"})), &mut f).await;
        run(&fx, &step(json!({"type": "SET", "variable": "big", "expression": "n > 40"})), &mut f).await;
        assert_eq!(f.variables["n"], json!(42));
        assert_eq!(f.variables["label"], json!("plain text"));
        assert_eq!(f.variables["big"], json!(true));
    }

    #[tokio::test]
    async fn failing_templates_degrade_visibly() {
        let fx = Fixture::new(json!([]));
        let mut f = frame(json!({}));
        let (_, out) = run(&fx, &step(json!({"type": "SAY", "value": "Total: {{ missing.value + 1 }}"})), &mut f).await;
        assert_eq!(out, ["Total: {{missing.value + 1}}"]);
        run(&fx, &step(json!({"type": "SET", "variable": "x", "value": "{{ 1 / 0 }}"})), &mut f).await;
        assert_eq!(f.variables["x"], json!("{{ 1 / 0 }}"));
    }

    #[tokio::test]
    async fn say_get_suspends() {
        let fx = Fixture::new(json!([]));
        let mut f = frame(json!({}));
        let (outcome, out) = run(&fx, &step(json!({"type": "SAY-GET", "value": "PIN?", "variable": "pin"})), &mut f).await;
        assert!(matches!(outcome, StepOutcome::Suspend { ref variable } if variable == "pin"));
        assert_eq!(out, ["PIN?"]);
        assert!(f.is_awaiting_input());
        assert_eq!(f.pending_prompt.as_deref(), Some("PIN?"));
    }

    #[tokio::test]
    async fn switch_exact_match_and_default() {
        let fx = Fixture::new(json!([]));
        let s = switch_step(true);
        assert_eq!(branch_output(&fx, &s, json!({"choice": "1"})).await.unwrap(), ["A"]);
        assert_eq!(branch_output(&fx, &s, json!({"choice": 1})).await.unwrap(), ["A"]);
        assert_eq!(branch_output(&fx, &s, json!({"choice": "2"})).await.unwrap(), ["D"]);
    }

    #[tokio::test]
    async fn switch_without_default_fails() {
        let fx = Fixture::new(json!([]));
        let err = branch_output(&fx, &switch_step(false), json!({"choice": "2"})).await.unwrap_err();
        assert!(matches!(err, EngineError::BranchNotMatched { ref value, .. } if value == "2"));
    }

    #[tokio::test]
    async fn case_first_true_wins() {
        let fx = Fixture::new(json!([]));
        let s = step(json!({"type": "CASE", "branches": {
            "condition:amount > 100": {"type": "SAY", "value": "first"},
            "condition:amount > 10": {"type": "SAY", "value": "second"},
            "default": {"type": "SAY", "value": "none"}
        }}));
        assert_eq!(branch_output(&fx, &s, json!({"amount": 500})).await.unwrap(), ["first"]);
        assert_eq!(branch_output(&fx, &s, json!({"amount": 50})).await.unwrap(), ["second"]);
        assert_eq!(branch_output(&fx, &s, json!({"amount": 5})).await.unwrap(), ["none"]);
    }

    #[tokio::test]
    async fn case_without_match_or_default_fails() {
        let fx = Fixture::new(json!([]));
        let s = step(json!({"type": "CASE", "branches": {"condition:false": {"type": "SAY", "value": "x"}}}));
        assert!(matches!(
            branch_output(&fx, &s, json!({})).await,
            Err(EngineError::BranchNotMatched { .. })
        ));
    }

    #[tokio::test]
    async fn return_discards_remaining_steps() {
        let fx = Fixture::new(json!([]));
        let flow: FlowDefinition = serde_json::from_value(json!({"id": "f", "steps": [
            {"type": "SAY", "value": "later"}
        ]}))
        .unwrap();
        let mut f = FlowFrame::new(&flow, json!({"x": 3}).as_object().cloned().unwrap());
        let (outcome, _) = run(&fx, &step(json!({"type": "RETURN", "value": "{{ x + 1 }}"})), &mut f).await;
        assert!(matches!(outcome, StepOutcome::Terminate(Some(ref v)) if *v == json!(4)));
        assert_eq!(f.remaining_count(), 0);
    }

    #[tokio::test]
    async fn flow_step_evaluates_args() {
        let fx = Fixture::new(json!([]));
        let mut f = frame(json!({"attempt_count": 2}));
        let s = step(json!({"type": "FLOW", "name": "retry", "callType": "replace",
                            "args": {"attempt_count": "{{ attempt_count + 1 }}"}}));
        match run(&fx, &s, &mut f).await.0 {
            StepOutcome::Transfer(t) => {
                assert_eq!(t.flow, "retry");
                assert_eq!(t.call_type, CallType::Replace);
                assert_eq!(t.args["attempt_count"], json!(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_result_is_stored() {
        let fx = Fixture::new(json!([{"id": "quote", "implementation": {"type": "mock",
            "payload": {"price": "{{ args.qty * 2 }}"}}}]));
        let mut f = frame(json!({"n": 4}));
        let s = step(json!({"type": "CALL-TOOL", "tool": "quote", "args": {"qty": "{{n}}"}, "variable": "q"}));
        assert!(matches!(run(&fx, &s, &mut f).await.0, StepOutcome::Continue));
        assert_eq!(f.variables["q"], json!({"price": 8}));
    }

    #[tokio::test]
    async fn tool_failure_runs_on_fail_handler() {
        let fx = Fixture::new(json!([]));
        let mut f = frame(json!({}));
        let s = step(json!({"type": "CALL-TOOL", "tool": "missing",
                            "onFail": {"type": "SAY", "value": "fallback: {{ lastError.class }}"}}));
        assert!(matches!(run(&fx, &s, &mut f).await.0, StepOutcome::Continue));
        let handler = f.next_step().unwrap();
        let (_, out) = run(&fx, &handler, &mut f).await;
        assert_eq!(out, ["fallback: generic"]);
    }

    #[tokio::test]
    async fn tool_failure_without_handler_cancels_with_message() {
        let fx = Fixture::new(json!([{"id": "strict", "implementation": {"type": "mock", "payload": 1},
            "parameters": {"type": "object", "required": ["id"]}}]));
        let mut f = frame(json!({}));
        f.push_step(step(json!({"type": "SAY", "value": "never"})));
        let s = step(json!({"type": "CALL-TOOL", "tool": "strict", "args": {}}));
        let (outcome, out) = run(&fx, &s, &mut f).await;
        assert!(matches!(outcome, StepOutcome::Cancel));
        assert_eq!(out, [fx.messages.get("en", keys::TOOL_UNRECOVERABLE)]);
        assert_eq!(f.remaining_count(), 0);
    }
}
