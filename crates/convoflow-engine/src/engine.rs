//! The flow stack controller.
//!
//! [`FlowEngine::update_activity`] takes one turn and the caller's
//! [`Session`] and returns the reply together with the updated session.  The
//! input session is never mutated, so a host can persist or discard the
//! result freely.
//!
//! Within a turn the controller:
//!
//! 1. handles control commands (cancel, help, status) while a flow waits
//!    for input,
//! 2. detects intents and starts or interrupts flows,
//! 3. otherwise binds the turn to the variable the active frame asked for,
//! 4. runs steps until a frame waits for input or the stack is empty.
//!
//! Structural failures end the stack and start the configured recovery flow
//! (or emit a localized apology).

use std::sync::Arc;

use chrono::Utc;
use convoflow_expr::{Evaluator, FunctionTable, JsonMap, Value};
use convoflow_tools::{CapabilityTable, HttpTransport, RateLimiter, ToolDefinition, ToolInvoker, ToolRegistry};
use tracing::{debug, error, info, warn};

use crate::config::{ControlCommand, EngineConfig};
use crate::error::{EngineError, Result};
use crate::flow::{CallType, FlowDefinition, VariableScope};
use crate::intent::{IntentClassifier, IntentDetector};
use crate::interpreter::{StepContext, StepInterpreter, StepOutcome, Transfer};
use crate::messages::{Messages, keys};
use crate::registry::FlowRegistry;
use crate::session::{FlowFrame, FrameState, Session};
use crate::turn::{ActivityResult, Role, Turn};
use crate::validation::{Severity, ValidationReport, validate};

// ═══════════════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════════════

/// Assembles a [`FlowEngine`].
#[derive(Default)]
pub struct FlowEngineBuilder {
    flows: Vec<FlowDefinition>,
    tools: Vec<ToolDefinition>,
    capabilities: CapabilityTable,
    globals: JsonMap,
    functions: FunctionTable,
    classifier: Option<Arc<dyn IntentClassifier>>,
    messages: Messages,
    transport: Option<Arc<dyn HttpTransport>>,
    rate_limiter: Option<RateLimiter>,
    config: EngineConfig,
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flows(mut self, flows: impl IntoIterator<Item = FlowDefinition>) -> Self {
        self.flows.extend(flows);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Host capabilities backing `capability` tools.
    pub fn capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Read-only values visible to every expression as `global.*`.
    pub fn globals(mut self, globals: JsonMap) -> Self {
        self.globals = globals;
        self
    }

    /// Host functions callable from expressions.
    pub fn functions(mut self, functions: FunctionTable) -> Self {
        self.functions = functions;
        self
    }

    pub fn intent_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn messages(mut self, messages: Messages) -> Self {
        self.messages = messages;
        self
    }

    /// Replace the HTTP transport used by `http` tools.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share rate-limit windows with another engine.
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// Fails on duplicate flow or tool ids.  Every other definition problem
    /// is logged and surfaces at runtime instead.
    pub fn build(self) -> Result<FlowEngine> {
        let evaluator = Evaluator::with_functions(self.config.security_level, self.functions);
        let flows = FlowRegistry::new(self.flows)?;
        let tools = ToolRegistry::new(self.tools)?;

        let report = validate(&flows, &tools, &evaluator);
        for issue in &report.issues {
            match issue.severity {
                Severity::Error => error!(flow = %issue.flow, "{issue}"),
                Severity::Warning => warn!(flow = %issue.flow, "{issue}"),
            }
        }
        if let Some(recovery) = &self.config.recovery_flow
            && !flows.contains(recovery)
        {
            warn!(flow = %recovery, "recovery flow is not registered");
        }

        let mut invoker = ToolInvoker::new(tools, self.capabilities, evaluator.clone())
            .with_retry(self.config.retry.clone());
        if let Some(transport) = self.transport {
            invoker = invoker.with_transport(transport);
        }
        if let Some(limiter) = self.rate_limiter {
            invoker = invoker.with_rate_limiter(limiter);
        }

        let intents = IntentDetector::new(flows.clone(), self.classifier, self.config.min_intent_confidence);

        info!(
            flows = flows.len(),
            tools = invoker.registry().len(),
            errors = report.errors().count(),
            warnings = report.warnings().count(),
            "flow engine ready"
        );

        Ok(FlowEngine {
            flows,
            invoker,
            evaluator,
            globals: self.globals,
            messages: self.messages,
            config: self.config,
            intents,
            report,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

/// Drives conversational flows one turn at a time.
///
/// The engine holds only immutable definitions and shared rate-limit state;
/// all per-conversation state lives in the [`Session`] the host passes in.
#[derive(Debug)]
pub struct FlowEngine {
    flows: FlowRegistry,
    invoker: ToolInvoker,
    evaluator: Evaluator,
    globals: JsonMap,
    messages: Messages,
    config: EngineConfig,
    intents: IntentDetector,
    report: ValidationReport,
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    pub fn intents(&self) -> &IntentDetector {
        &self.intents
    }

    /// Findings collected when the engine was built.
    pub fn validation_report(&self) -> &ValidationReport {
        &self.report
    }

    /// A fresh, idle session.
    pub fn init_session(&self, user_id: impl Into<String>, session_id: impl Into<String>) -> Session {
        let session = Session::new(user_id, session_id);
        debug!(session_id = %session.id, user_id = %session.user_id, "session initialized");
        session
    }

    /// Process one turn.
    ///
    /// Only an invalid session is an error; flow failures are handled inside
    /// the turn and reported through the response text.
    pub async fn update_activity(&self, turn: &Turn, session: &Session) -> Result<ActivityResult> {
        self.check_session(session)?;
        let mut session = session.clone();
        let mut output = Vec::new();

        if turn.role == Role::User {
            let locale = self.locale(&session);
            self.handle_turn(turn, &mut session, &locale, &mut output).await;
            session.updated_at = Utc::now();
        } else {
            debug!(session_id = %session.id, role = ?turn.role, "ignoring non-user turn");
        }

        Ok(ActivityResult {
            response: output.join("\n"),
            session,
        })
    }

    fn check_session(&self, session: &Session) -> Result<()> {
        if session.depth() > self.config.max_stack_depth {
            return Err(EngineError::InvalidSession {
                reason: format!(
                    "stack depth {} exceeds the limit of {}",
                    session.depth(),
                    self.config.max_stack_depth
                ),
            });
        }
        for frame in &session.flow_stack {
            if frame.state == FrameState::AwaitingInput && frame.pending_variable.is_none() {
                return Err(EngineError::InvalidSession {
                    reason: format!("frame `{}` awaits input without a target variable", frame.flow_id),
                });
            }
        }
        Ok(())
    }

    fn locale(&self, session: &Session) -> String {
        session
            .cargo
            .get("locale")
            .and_then(|v| v.as_str())
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.config.locale)
            .to_string()
    }

    // -----------------------------------------------------------------------
    // Turn handling
    // -----------------------------------------------------------------------

    async fn handle_turn(&self, turn: &Turn, session: &mut Session, locale: &str, output: &mut Vec<String>) {
        let text = turn.content.trim();
        let awaiting = session.is_awaiting_input();

        if awaiting && let Some(command) = self.config.control_commands.recognize(text) {
            self.control(command, session, locale, output);
            return;
        }

        let detected = match &turn.intent {
            Some(name) => match self.intents.explicit(name) {
                Some(intent) => Some(intent),
                None => {
                    let err = EngineError::FlowNotFound { flow: name.clone() };
                    self.recover(session, err, locale, output).await;
                    return;
                }
            },
            None if !awaiting || self.config.detect_interruptions => self.intents.detect(text).await,
            None => None,
        };

        let active_flow = session.active().map(|f| f.flow_id.clone());
        let started = match detected {
            Some(intent) if active_flow.as_deref() != Some(intent.flow_id.as_str()) => {
                if let Some(frame) = session.active_mut()
                    && frame.is_awaiting_input()
                {
                    frame.progress_saved = true;
                    info!(
                        session_id = %session.id,
                        interrupted = ?active_flow,
                        flow_id = %intent.flow_id,
                        "flow interrupted"
                    );
                }
                debug!(flow_id = %intent.flow_id, source = ?intent.source, "intent detected");
                self.attach(
                    session,
                    Transfer {
                        flow: intent.flow_id,
                        call_type: CallType::Call,
                        args: JsonMap::new(),
                        variable: None,
                    },
                )
            }
            _ if awaiting => {
                if let Some(frame) = session.active_mut() {
                    frame.accept_input(text);
                }
                Ok(())
            }
            _ if session.is_idle() => {
                let flows = self.trigger_flow_names().join(", ");
                output.push(self.messages.get_with(locale, keys::FLOW_NO_MATCH, &[("flows", flows.as_str())]));
                return;
            }
            // The active flow was named again; keep running it.
            _ => Ok(()),
        };

        let result = match started {
            Ok(()) => self.drive(session, locale, output).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.recover(session, e, locale, output).await;
        }
    }

    fn control(&self, command: ControlCommand, session: &mut Session, locale: &str, output: &mut Vec<String>) {
        match command {
            ControlCommand::Cancel => {
                info!(session_id = %session.id, frames = session.depth(), "flows cancelled by user");
                session.flow_stack.clear();
                output.push(self.messages.get(locale, keys::CANCELLED));
            }
            ControlCommand::Help | ControlCommand::Status => {
                let Some(frame) = session.active() else { return };
                let text = if command == ControlCommand::Help {
                    let flows = self.trigger_flow_names().join(", ");
                    self.messages
                        .get_with(locale, keys::HELP, &[("flow", frame.flow_name.as_str()), ("flows", flows.as_str())])
                } else {
                    let depth = session.depth().to_string();
                    let remaining = frame.remaining_count().to_string();
                    self.messages.get_with(
                        locale,
                        keys::STATUS,
                        &[
                            ("flow", frame.flow_name.as_str()),
                            ("depth", depth.as_str()),
                            ("remaining", remaining.as_str()),
                        ],
                    )
                };
                output.push(text);
                if let Some(prompt) = &frame.pending_prompt {
                    output.push(prompt.clone());
                }
            }
        }
    }

    /// Names of the flows a user can start by saying something.
    fn trigger_flow_names(&self) -> Vec<&str> {
        let startable: Vec<&str> = self
            .flows
            .iter()
            .filter(|f| !f.metadata.triggers.is_empty())
            .map(|f| f.display_name())
            .collect();
        if startable.is_empty() {
            self.flows.iter().map(|f| f.display_name()).collect()
        } else {
            startable
        }
    }

    // -----------------------------------------------------------------------
    // Stack operations
    // -----------------------------------------------------------------------

    /// Attach a flow according to its call type.
    fn attach(&self, session: &mut Session, transfer: Transfer) -> Result<()> {
        let flow = self
            .flows
            .get(&transfer.flow)
            .ok_or_else(|| EngineError::FlowNotFound {
                flow: transfer.flow.clone(),
            })?
            .clone();

        let return_variable = match transfer.call_type {
            CallType::Call => transfer.variable,
            CallType::Replace => session.flow_stack.pop().and_then(|replaced| replaced.return_variable),
            CallType::Reboot => {
                session.flow_stack.clear();
                None
            }
        };

        let occurrences = session.occurrences(&flow.id);
        if occurrences > 0 {
            let mut chain = session.chain();
            chain.push(&flow.id);
            let chain = chain.join(" -> ");
            if occurrences >= self.config.max_flow_recursion {
                return Err(EngineError::CircularFlowReference { chain });
            }
            warn!(session_id = %session.id, %chain, "flow re-entered while already active");
        }
        if session.depth() >= self.config.max_stack_depth {
            return Err(EngineError::StackOverflow {
                max_depth: self.config.max_stack_depth,
            });
        }

        for spec in &flow.variables {
            if spec.scope == VariableScope::Session {
                session
                    .cargo
                    .entry(spec.name.clone())
                    .or_insert_with(|| spec.value.clone());
            }
        }

        let frame = FlowFrame::new(&flow, transfer.args).with_return_variable(return_variable);
        if flow.metadata.audit {
            info!(
                target: "convoflow::audit",
                session_id = %session.id,
                user_id = %session.user_id,
                flow_id = %flow.id,
                version = %flow.version,
                transaction_id = %frame.transaction_id,
                risk = ?flow.metadata.risk_level,
                call_type = %transfer.call_type,
                "flow started"
            );
        } else {
            debug!(flow_id = %flow.id, call_type = %transfer.call_type, depth = session.depth() + 1, "flow started");
        }
        session.flow_stack.push(frame);
        Ok(())
    }

    /// Pop the top frame and deliver its return value.
    fn finish(&self, session: &mut Session, value: Option<serde_json::Value>, locale: &str, output: &mut Vec<String>) {
        let Some(done) = session.flow_stack.pop() else {
            return;
        };
        if self.flows.get(&done.flow_id).is_some_and(|f| f.metadata.audit) {
            info!(
                target: "convoflow::audit",
                session_id = %session.id,
                flow_id = %done.flow_id,
                transaction_id = %done.transaction_id,
                "flow completed"
            );
        } else {
            debug!(flow_id = %done.flow_id, "flow completed");
        }

        if let Some(value) = value {
            match (done.return_variable, session.active_mut()) {
                (Some(variable), Some(caller)) => {
                    caller.variables.insert(variable, value);
                }
                _ => {
                    let text = Value::from(&value).display();
                    if !text.is_empty() {
                        output.push(text);
                    }
                }
            }
        }

        self.resume(session, locale, output);
    }

    /// End the failed frame and every caller waiting on it.  Stops at a
    /// frame that was interrupted while waiting for input, which resumes.
    fn cancel_chain(&self, session: &mut Session, locale: &str, output: &mut Vec<String>) {
        let mut cancelled = Vec::new();
        while session.active().is_some_and(|f| !f.is_awaiting_input()) {
            if let Some(frame) = session.flow_stack.pop() {
                cancelled.push(frame.flow_id);
            }
        }
        warn!(
            session_id = %session.id,
            cancelled = %cancelled.join(" <- "),
            "call chain cancelled after tool failure"
        );
        self.resume(session, locale, output);
    }

    /// Re-ask the question of an interrupted frame that is on top again.
    fn resume(&self, session: &mut Session, locale: &str, output: &mut Vec<String>) {
        if let Some(next) = session.active_mut()
            && next.is_awaiting_input()
        {
            if next.progress_saved {
                output.push(self.messages.get(locale, keys::PROGRESS_SAVED));
                next.progress_saved = false;
            }
            if let Some(prompt) = &next.pending_prompt {
                output.push(prompt.clone());
            }
        }
    }

    /// Run steps until the top frame waits for input or the stack empties.
    async fn drive(&self, session: &mut Session, locale: &str, output: &mut Vec<String>) -> Result<()> {
        let session_id = session.id.clone();
        let user_id = session.user_id.clone();
        let interpreter = StepInterpreter::new(StepContext {
            evaluator: &self.evaluator,
            invoker: &self.invoker,
            messages: &self.messages,
            globals: &self.globals,
            locale,
            session_id: &session_id,
            user_id: &user_id,
        });

        let mut executed = 0usize;
        loop {
            let Some(frame) = session.flow_stack.last_mut() else {
                return Ok(());
            };
            match frame.state {
                FrameState::AwaitingInput => return Ok(()),
                FrameState::Completed | FrameState::Failed => {
                    self.finish(session, None, locale, output);
                    continue;
                }
                FrameState::Running => {}
            }
            let Some(step) = frame.next_step() else {
                frame.state = FrameState::Completed;
                self.finish(session, None, locale, output);
                continue;
            };

            executed += 1;
            if executed > self.config.max_steps_per_turn {
                return Err(EngineError::StepBudgetExceeded {
                    limit: self.config.max_steps_per_turn,
                });
            }

            let outcome = interpreter.execute(&step, frame, &session.cargo, output).await;
            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Suspend { variable } => {
                    debug!(%session_id, %variable, "waiting for input");
                    return Ok(());
                }
                StepOutcome::Terminate(value) => {
                    if let Some(frame) = session.active_mut() {
                        frame.state = FrameState::Completed;
                    }
                    self.finish(session, value, locale, output);
                }
                StepOutcome::Cancel => self.cancel_chain(session, locale, output),
                StepOutcome::Fail(err) => {
                    if let Some(frame) = session.active_mut() {
                        frame.state = FrameState::Failed;
                    }
                    return Err(err);
                }
                StepOutcome::Transfer(transfer) => self.attach(session, transfer)?,
            }
        }
    }

    /// Handle a structural failure: start the recovery flow or apologize.
    async fn recover(&self, session: &mut Session, err: EngineError, locale: &str, output: &mut Vec<String>) {
        error!(
            session_id = %session.id,
            chain = %session.chain().join(" -> "),
            error = %err,
            structural = err.is_structural(),
            "flow failed"
        );

        if let Some(recovery) = &self.config.recovery_flow
            && let Some(flow) = self.flows.get(recovery)
            && session.occurrences(&flow.id) == 0
        {
            let mut args = JsonMap::new();
            args.insert("error".into(), serde_json::Value::String(err.to_string()));
            let transfer = Transfer {
                flow: flow.id.clone(),
                call_type: CallType::Reboot,
                args,
                variable: None,
            };
            let result = match self.attach(session, transfer) {
                Ok(()) => self.drive(session, locale, output).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return,
                Err(e) => error!(session_id = %session.id, error = %e, "recovery flow failed"),
            }
        }

        session.flow_stack.clear();
        output.push(self.messages.get(locale, keys::FLOW_ERROR));
    }
}
