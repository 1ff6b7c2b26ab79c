//! Static checks over flow definitions.
//!
//! [`validate`] never fails; it collects [`Issue`]s.  Errors describe
//! definitions that cannot work at runtime (unknown tools or flows, blocked
//! or malformed expressions).  Warnings describe suspicious shapes:
//! branch steps without a default, unreachable steps and reference cycles.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use convoflow_expr::{Evaluator, template};
use convoflow_tools::ToolRegistry;

use crate::flow::{CONDITION_PREFIX, DEFAULT_BRANCH, FlowDefinition, StepDefinition};
use crate::registry::FlowRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    /// Flow id.
    pub flow: String,
    /// Location inside the flow, e.g. `steps[2].branches.default`.
    pub step: Option<String>,
    pub message: String,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}: {} at {}: {}", self.severity, self.flow, step, self.message),
            None => write!(f, "{}: {}: {}", self.severity, self.flow, self.message),
        }
    }
}

/// Everything [`validate`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check every flow in `flows`.
pub fn validate(flows: &FlowRegistry, tools: &ToolRegistry, evaluator: &Evaluator) -> ValidationReport {
    let mut report = ValidationReport::default();
    for flow in flows.iter() {
        let mut checker = Checker {
            flow,
            flows,
            tools,
            evaluator,
            issues: &mut report.issues,
        };
        checker.steps(&flow.steps, "steps");
    }
    report.issues.extend(cycles(flows));
    report
}

// ---------------------------------------------------------------------------
// Per-flow checks
// ---------------------------------------------------------------------------

struct Checker<'a> {
    flow: &'a FlowDefinition,
    flows: &'a FlowRegistry,
    tools: &'a ToolRegistry,
    evaluator: &'a Evaluator,
    issues: &'a mut Vec<Issue>,
}

impl Checker<'_> {
    fn push(&mut self, severity: Severity, at: &str, message: String) {
        self.issues.push(Issue {
            severity,
            flow: self.flow.id.clone(),
            step: Some(at.to_string()),
            message,
        });
    }

    fn steps(&mut self, steps: &[StepDefinition], at: &str) {
        let mut returned = false;
        for (i, step) in steps.iter().enumerate() {
            let here = format!("{at}[{i}]");
            if returned {
                self.push(Severity::Warning, &here, "unreachable step after RETURN".into());
                returned = false;
            }
            self.step(step, &here);
            if matches!(step, StepDefinition::Return(_)) {
                returned = true;
            }
        }
    }

    fn step(&mut self, step: &StepDefinition, at: &str) {
        match step {
            StepDefinition::Say(say) => {
                for text in say.value.variants() {
                    self.template(text, at);
                }
            }
            StepDefinition::SayGet(ask) => {
                for text in ask.value.variants() {
                    self.template(text, at);
                }
            }
            StepDefinition::Set(set) => match &set.expression {
                Some(expression) => self.expression(expression, at),
                None => self.json(&set.value, at),
            },
            StepDefinition::CallTool(call) => {
                if !self.tools.contains(&call.tool) {
                    self.push(Severity::Error, at, format!("unknown tool `{}`", call.tool));
                }
                for value in call.args.iter().flat_map(|a| a.values()) {
                    self.json(value, at);
                }
                if let Some(handler) = &call.on_fail {
                    self.step(handler, &format!("{at}.onFail"));
                }
            }
            StepDefinition::Flow(flow) => {
                if !self.flows.contains(&flow.name) {
                    self.push(Severity::Error, at, format!("unknown flow `{}`", flow.name));
                }
                for value in flow.args.values() {
                    self.json(value, at);
                }
            }
            StepDefinition::Switch(switch) => {
                if template::has_tokens(&switch.variable) {
                    self.template(&switch.variable, at);
                } else if template::parse_path(switch.variable.trim()).is_none() {
                    self.expression(&switch.variable, at);
                }
                if !switch.branches.contains_key(DEFAULT_BRANCH) {
                    self.push(Severity::Warning, at, "SWITCH has no default branch".into());
                }
                for (key, branch) in &switch.branches {
                    self.step(branch, &format!("{at}.branches.{key}"));
                }
            }
            StepDefinition::Case(case) => {
                if !case.branches.contains_key(DEFAULT_BRANCH) {
                    self.push(Severity::Warning, at, "CASE has no default branch".into());
                }
                let mut always_true: Option<&str> = None;
                for (key, branch) in &case.branches {
                    let here = format!("{at}.branches.{key}");
                    if key == DEFAULT_BRANCH {
                        self.step(branch, &here);
                        continue;
                    }
                    if let Some(earlier) = always_true {
                        self.push(
                            Severity::Warning,
                            &here,
                            format!("unreachable branch: `{earlier}` is always true"),
                        );
                    }
                    let condition = key.strip_prefix(CONDITION_PREFIX).unwrap_or(key.as_str());
                    self.expression(condition, &here);
                    if always_true.is_none() && is_literal_true(condition) {
                        always_true = Some(key.as_str());
                    }
                    self.step(branch, &here);
                }
            }
            StepDefinition::Return(ret) => {
                if let Some(value) = &ret.value {
                    self.json(value, at);
                }
            }
        }
    }

    fn template(&mut self, text: &str, at: &str) {
        if template::has_tokens(text)
            && let Err(e) = self.evaluator.check(text)
        {
            self.push(Severity::Error, at, format!("invalid template `{text}`: {e}"));
        }
    }

    fn expression(&mut self, source: &str, at: &str) {
        if let Err(e) = self.evaluator.check(source) {
            self.push(Severity::Error, at, format!("invalid expression `{source}`: {e}"));
        }
    }

    fn json(&mut self, value: &serde_json::Value, at: &str) {
        match value {
            serde_json::Value::String(s) => self.template(s, at),
            serde_json::Value::Array(items) => items.iter().for_each(|v| self.json(v, at)),
            serde_json::Value::Object(map) => map.values().for_each(|v| self.json(v, at)),
            _ => {}
        }
    }
}

fn is_literal_true(condition: &str) -> bool {
    matches!(condition.trim(), "true" | "1" | "!false")
}

// ---------------------------------------------------------------------------
// Reference cycles
// ---------------------------------------------------------------------------

/// Flow ids referenced by FLOW steps in `step` or nested under it.
fn references(flows: &FlowRegistry, step: &StepDefinition, out: &mut Vec<String>) {
    if let StepDefinition::Flow(flow) = step
        && let Some(target) = flows.get(&flow.name)
        && !out.contains(&target.id)
    {
        out.push(target.id.clone());
    }
    for (_, child) in step.children() {
        references(flows, child, out);
    }
}

/// One warning per distinct cycle, self references included.
fn cycles(flows: &FlowRegistry) -> Vec<Issue> {
    let graph: Vec<(String, Vec<String>)> = flows
        .iter()
        .map(|flow| {
            let mut refs = Vec::new();
            for step in &flow.steps {
                references(flows, step, &mut refs);
            }
            (flow.id.clone(), refs)
        })
        .collect();
    let edges = |id: &str| {
        graph
            .iter()
            .find(|(from, _)| from == id)
            .map(|(_, to)| to.as_slice())
            .unwrap_or_default()
    };

    let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
    let mut issues = Vec::new();
    for (start, _) in &graph {
        // Depth-first walk carrying the current path.
        let mut stack: Vec<(Vec<String>, usize)> = vec![(vec![start.clone()], 0)];
        while let Some((path, next)) = stack.pop() {
            let Some(current) = path.last() else { continue };
            let targets = edges(current);
            let Some(target) = targets.get(next) else { continue };
            stack.push((path.clone(), next + 1));
            if let Some(pos) = path.iter().position(|p| p == target) {
                let members: BTreeSet<String> = path[pos..].iter().cloned().collect();
                if seen.insert(members) {
                    let mut chain = path[pos..].to_vec();
                    chain.push(target.clone());
                    issues.push(Issue {
                        severity: Severity::Warning,
                        flow: path[pos].clone(),
                        step: None,
                        message: format!("flow reference cycle: {}", chain.join(" -> ")),
                    });
                }
            } else {
                let mut extended = path.clone();
                extended.push(target.clone());
                stack.push((extended, 0));
            }
        }
    }
    issues
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
