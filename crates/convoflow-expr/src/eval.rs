//! The evaluator: security gates plus a tree-walking interpreter.
//!
//! Every entry point runs the same pipeline over code:
//!
//! 1. substitution ([`crate::template::substitute`]) turns path tokens into
//!    typed slots,
//! 2. the deny-list ([`crate::security::screen`]) inspects the remaining
//!    source,
//! 3. the source is tokenized and parsed,
//! 4. the AST is admitted against the [`SecurityLevel`],
//! 5. the AST is interpreted.
//!
//! Template prose (the literal text around tokens) is never treated as code.

use std::cmp::Ordering;

use crate::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use crate::error::{EvalError, Result};
use crate::functions::FunctionTable;
use crate::methods;
use crate::parser::parse_expression;
use crate::scope::Scope;
use crate::security::{self, SecurityLevel, is_forbidden_property};
use crate::template::{self, Segment};
use crate::value::{Value, format_number, parse_decimal};

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluates templates and expressions under a fixed security level.
///
/// An evaluator is immutable after construction and cheap to share.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    level: SecurityLevel,
    functions: FunctionTable,
}

impl Evaluator {
    /// An evaluator with no host functions.
    pub fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            functions: FunctionTable::new(),
        }
    }

    /// An evaluator that can also call the given host functions.
    pub fn with_functions(level: SecurityLevel, functions: FunctionTable) -> Self {
        Self { level, functions }
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Evaluate a template or expression.
    ///
    /// - exactly one `{{...}}` token: the token's typed value,
    /// - literal text mixed with tokens: the rendered string,
    /// - no tokens: the text is evaluated as an expression.
    pub fn evaluate(&self, text: &str, scope: &Scope<'_>) -> Result<Value> {
        let text = text.trim();
        let segments = template::segments(text);
        match segments.as_slice() {
            [Segment::Path(path)] => template::resolve(path, scope),
            [Segment::Expression(inner)] => self.evaluate_expression(inner, scope),
            segs if segs.iter().all(|s| matches!(s, Segment::Text(_))) => {
                self.evaluate_expression(text, scope)
            }
            segs => self.render(segs, scope).map(Value::String),
        }
    }

    /// Evaluate `source` as code.  Embedded `{{path}}` tokens are spliced as
    /// typed slots first.
    pub fn evaluate_expression(&self, source: &str, scope: &Scope<'_>) -> Result<Value> {
        let substitution = template::substitute(source, scope)?;
        let expr = self.compile(&substitution.source)?;
        Interpreter {
            scope,
            slots: &substitution.slots,
            functions: &self.functions,
        }
        .eval(&expr)
    }

    /// Evaluate a condition to a boolean using truthiness.
    pub fn evaluate_condition(&self, source: &str, scope: &Scope<'_>) -> Result<bool> {
        self.evaluate_expression(source, scope).map(|v| v.is_truthy())
    }

    /// Render a template to a string.  Fails on the first token error.
    pub fn evaluate_template(&self, text: &str, scope: &Scope<'_>) -> Result<String> {
        self.render(&template::segments(text), scope)
    }

    /// Render a template, leaving any token that fails to evaluate visible
    /// in its original `{{...}}` form.
    pub fn render_lenient(&self, text: &str, scope: &Scope<'_>) -> String {
        let mut out = String::with_capacity(text.len());
        for segment in template::segments(text) {
            match self.render_segment(&segment, scope) {
                Ok(s) => out.push_str(&s),
                Err(e) => {
                    tracing::warn!(token = %segment.token_text(), error = %e, "template token failed");
                    out.push_str(&segment.token_text());
                }
            }
        }
        out
    }

    /// Evaluate a JSON value whose strings may be templates.
    ///
    /// Strings containing tokens go through [`Evaluator::evaluate`]; other
    /// strings are literal.  Arrays and objects are walked recursively.
    pub fn evaluate_json(&self, value: &serde_json::Value, scope: &Scope<'_>) -> Result<Value> {
        match value {
            serde_json::Value::String(s) if template::has_tokens(s) => self.evaluate(s, scope),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| self.evaluate_json(v, scope))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            serde_json::Value::Object(map) => {
                let mut out = indexmap::IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.evaluate_json(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(Value::from(other)),
        }
    }

    /// Run every static check without evaluating: the deny-list, parsing and
    /// the security policy.  Used by flow validation.
    pub fn check(&self, text: &str) -> Result<()> {
        let segments = template::segments(text);
        if segments.iter().all(|s| matches!(s, Segment::Text(_))) {
            return self.compile(text).map(drop);
        }
        for segment in &segments {
            match segment {
                Segment::Text(_) => {}
                Segment::Path(path) => {
                    if let Some(bad) = path.iter().find(|p| is_forbidden_property(p)) {
                        return Err(EvalError::blocked(format!("access to `{bad}`")));
                    }
                }
                Segment::Expression(inner) => {
                    self.compile(inner)?;
                }
            }
        }
        Ok(())
    }

    /// Screen, parse and admit `source`.
    pub fn compile(&self, source: &str) -> Result<Expr> {
        security::screen(source)?;
        let expr = parse_expression(source)?;
        security::admit(&expr, self.level, &self.functions)?;
        Ok(expr)
    }

    fn render(&self, segments: &[Segment], scope: &Scope<'_>) -> Result<String> {
        let mut out = String::new();
        for segment in segments {
            out.push_str(&self.render_segment(segment, scope)?);
        }
        Ok(out)
    }

    fn render_segment(&self, segment: &Segment, scope: &Scope<'_>) -> Result<String> {
        match segment {
            Segment::Text(t) => Ok(t.clone()),
            Segment::Path(path) => template::resolve(path, scope).map(|v| v.display()),
            Segment::Expression(inner) => self.evaluate_expression(inner, scope).map(|v| v.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

struct Interpreter<'a, 's> {
    scope: &'a Scope<'s>,
    slots: &'a [Value],
    functions: &'a FunctionTable,
}

impl Interpreter<'_, '_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Slot(i) => Ok(self.slots.get(*i).cloned().unwrap_or_default()),
            Expr::Ident(name) => Ok(self.scope.lookup(name).unwrap_or_default()),
            Expr::Array(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Member { object, property } => {
                let target = self.eval(object)?;
                read_property(&target, property)
            }
            Expr::Index { object, index } => {
                let target = self.eval(object)?;
                let key = match self.eval(index)? {
                    Value::String(s) => s,
                    Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => format_number(n),
                    other => {
                        return Err(EvalError::type_mismatch(format!(
                            "cannot index with {}",
                            other.type_name()
                        )));
                    }
                };
                read_property(&target, &key)
            }
            Expr::Call { callee, args } => self.call(callee, args),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                    UnaryOp::Neg => numeric_operand(&v, "-").map(|n| Value::Number(-n)),
                    UnaryOp::Plus => numeric_operand(&v, "+").map(Value::Number),
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary(*op, &l, &r)
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match (op, l.is_truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(l),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    fn call(&self, callee: &Expr, args: &[Expr]) -> Result<Value> {
        let args = args
            .iter()
            .map(|e| self.eval(e))
            .collect::<Result<Vec<_>>>()?;
        match callee {
            Expr::Ident(name) => {
                if let Some(f) = self.functions.get(name) {
                    f(&args)
                } else if methods::is_global_function(name) {
                    methods::call_global(name, &args)
                } else {
                    Err(EvalError::blocked(format!("`{name}` is not a registered function")))
                }
            }
            Expr::Member { object, property } => {
                if let Expr::Ident(ns) = object.as_ref()
                    && ns == "Math"
                {
                    return methods::call_math(property, &args);
                }
                if is_forbidden_property(property) || !methods::is_whitelisted_method(property) {
                    return Err(EvalError::blocked(format!("method `{property}` is not whitelisted")));
                }
                let receiver = self.eval(object)?;
                methods::call_method(&receiver, property, &args)
            }
            _ => Err(EvalError::blocked("only named functions and whitelisted methods may be called")),
        }
    }
}

fn read_property(target: &Value, property: &str) -> Result<Value> {
    if is_forbidden_property(property) {
        return Err(EvalError::blocked(format!("access to `{property}`")));
    }
    target.property(property).ok_or_else(|| EvalError::UndefinedAccess {
        property: property.to_string(),
        target: target.type_name().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add => add(l, r),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, l, r),
        BinaryOp::StrictEq => Ok(Value::Bool(l == r)),
        BinaryOp::StrictNotEq => Ok(Value::Bool(l != r)),
        BinaryOp::LooseEq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::LooseNotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
            let ordering = compare(op, l, r)?;
            let result = match (op, ordering) {
                (_, None) => false,
                (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                (BinaryOp::LtEq, Some(o)) => o != Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
    }
}

/// `+`: numeric addition for two numbers, concatenation when either side is
/// a string.
fn add(l: &Value, r: &Value) -> Result<Value> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => finite(a + b, "+"),
        (Value::String(_), _) | (_, Value::String(_)) => {
            Ok(Value::String(format!("{}{}", l.display(), r.display())))
        }
        _ => Err(EvalError::type_mismatch(format!(
            "cannot add {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    let a = numeric_operand(l, op.symbol())?;
    let b = numeric_operand(r, op.symbol())?;
    let result = match op {
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    finite(result, op.symbol())
}

fn numeric_operand(v: &Value, symbol: &str) -> Result<f64> {
    v.to_number().ok_or_else(|| {
        EvalError::arithmetic(format!(
            "operand of `{symbol}` is not numeric ({} {})",
            v.type_name(),
            v.to_json()
        ))
    })
}

fn finite(n: f64, symbol: &str) -> Result<Value> {
    if n.is_finite() {
        Ok(Value::Number(n))
    } else {
        Err(EvalError::arithmetic(format!("`{symbol}` produced a non-finite result")))
    }
}

/// `==`: same-type structural equality, `null == undefined`, and number vs
/// numeric string.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        _ if l.is_nullish() && r.is_nullish() => true,
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            parse_decimal(s) == Some(*n)
        }
        _ => std::mem::discriminant(l) == std::mem::discriminant(r) && l == r,
    }
}

/// Relational comparison.  `Ok(None)` means unordered (NaN involved).
fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Option<Ordering>> {
    let mismatch = || {
        EvalError::type_mismatch(format!(
            "cannot compare {} {} {}",
            l.type_name(),
            op.symbol(),
            r.type_name()
        ))
    };
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(a.partial_cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        (Value::Number(a), Value::String(_)) => {
            let b = r.to_number().ok_or_else(mismatch)?;
            Ok(a.partial_cmp(&b))
        }
        (Value::String(_), Value::Number(b)) => {
            let a = l.to_number().ok_or_else(mismatch)?;
            Ok(a.partial_cmp(b))
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvalErrorCode;
    use crate::scope::JsonMap;
    use serde_json::json;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    fn eval(src: &str) -> Result<Value> {
        Evaluator::new(SecurityLevel::Standard).evaluate(src, &Scope::new())
    }

    #[test]
    fn single_token_keeps_type() {
        let locals = map(json!({"n": 5, "user": {"name": "Ada"}}));
        let scope = Scope::new().with_locals(&locals);
        let ev = Evaluator::default();
        assert_eq!(ev.evaluate("{{n}}", &scope).unwrap(), Value::Number(5.0));
        assert_eq!(ev.evaluate("{{ n + 1 }}", &scope).unwrap(), Value::Number(6.0));
        assert_eq!(ev.evaluate("Hi {{user.name}}", &scope).unwrap(), Value::from("Hi Ada"));
        assert_eq!(ev.evaluate("{{missing}}", &scope).unwrap(), Value::Undefined);
    }

    #[test]
    fn method_chain_matches_std() {
        let input = "  MixedCase  ";
        let got = eval("\"  MixedCase  \".trim().toLowerCase()").unwrap();
        assert_eq!(got, Value::String(input.trim().to_lowercase()));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval("'a' + 'b'").unwrap(), Value::from("ab"));
        assert_eq!(eval("'n=' + 3").unwrap(), Value::from("n=3"));
        assert_eq!(eval("1 + 2").unwrap(), Value::Number(3.0));
        assert_eq!(eval("true + 1").unwrap_err().code(), EvalErrorCode::TypeMismatch);
    }

    #[test]
    fn numeric_operators_parse_strings() {
        assert_eq!(eval("'10' - 3").unwrap(), Value::Number(7.0));
        assert_eq!(eval("' 2.5 ' * 2").unwrap(), Value::Number(5.0));
        assert_eq!(eval("'abc' * 2").unwrap_err().code(), EvalErrorCode::Arithmetic);
        assert_eq!(eval("null - 1").unwrap_err().code(), EvalErrorCode::Arithmetic);
        assert_eq!(eval("1 / 0").unwrap_err().code(), EvalErrorCode::DivisionByZero);
        assert_eq!(eval("5 % 0").unwrap_err().code(), EvalErrorCode::DivisionByZero);
        assert_eq!(eval("7 % 3").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn math_calls_never_yield_nan() {
        assert_eq!(eval("Math.sqrt(-1)").unwrap_err().code(), EvalErrorCode::Arithmetic);
        assert_eq!(eval("Math.max()").unwrap_err().code(), EvalErrorCode::InvalidArgument);
        assert_eq!(eval("Math.sqrt(16) + Math.max(1, 2)").unwrap(), Value::Number(6.0));
    }

    #[test]
    fn equality_rules() {
        assert_eq!(eval("'1' === 1").unwrap(), Value::Bool(false));
        assert_eq!(eval("'1' == 1").unwrap(), Value::Bool(true));
        assert_eq!(eval("'x' == 1").unwrap(), Value::Bool(false));
        assert_eq!(eval("null == undefined").unwrap(), Value::Bool(true));
        assert_eq!(eval("null === undefined").unwrap(), Value::Bool(false));
        assert_eq!(eval("0 == false").unwrap(), Value::Bool(false));
        assert_eq!(eval("'' == 0").unwrap(), Value::Bool(false));
        assert_eq!(eval("[1, 2] == [1, 2]").unwrap(), Value::Bool(true));
    }

    #[test]
    fn relational_rules() {
        assert_eq!(eval("'150' > 100").unwrap(), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'").unwrap(), Value::Bool(true));
        // Lexicographic, not numeric, for two strings.
        assert_eq!(eval("'10' < '9'").unwrap(), Value::Bool(true));
        assert_eq!(eval("'abc' > 1").unwrap_err().code(), EvalErrorCode::TypeMismatch);
        assert_eq!(eval("true > 0").unwrap_err().code(), EvalErrorCode::TypeMismatch);
        assert_eq!(eval("null < 1").unwrap_err().code(), EvalErrorCode::TypeMismatch);
    }

    #[test]
    fn logical_operators_short_circuit() {
        // The right side would fail if evaluated.
        assert_eq!(eval("false && missing.x").unwrap(), Value::Bool(false));
        assert_eq!(eval("'a' || missing.x").unwrap(), Value::from("a"));
        assert_eq!(eval("'' || 'fallback'").unwrap(), Value::from("fallback"));
        assert_eq!(eval("1 > 2 ? 'yes' : 'no'").unwrap(), Value::from("no"));
    }

    #[test]
    fn undefined_member_access_is_an_error() {
        let err = eval("missing.name").unwrap_err();
        assert_eq!(err.code(), EvalErrorCode::UndefinedAccess);
        let locals = map(json!({"user": {}}));
        let scope = Scope::new().with_locals(&locals);
        let ev = Evaluator::default();
        assert_eq!(ev.evaluate("user.name", &scope).unwrap(), Value::Undefined);
    }

    #[test]
    fn slots_are_values_not_code() {
        let locals = map(json!({"answer": "1 || true"}));
        let scope = Scope::new().with_locals(&locals);
        let ev = Evaluator::default();
        assert!(!ev.evaluate_condition("{{answer}} === 1", &scope).unwrap());
        assert!(ev.evaluate_condition("{{answer}} === '1 || true'", &scope).unwrap());
    }

    #[test]
    fn deny_list_blocks_before_evaluation() {
        for src in [
            "eval('2+2')",
            "{{ constructor }}",
            "x = 1",
            "new Date()",
            "{{ user.__proto__ }}",
            "fetch('http://x')",
        ] {
            let err = eval(src).unwrap_err();
            assert!(err.is_blocked(), "{src}: {err}");
        }
    }

    #[test]
    fn prose_is_not_screened() {
        let locals = map(json!({"name": "Ada"}));
        let scope = Scope::new().with_locals(&locals);
        let ev = Evaluator::default();
        let out = ev
            .evaluate_template("Please do not delete this; {{name}} = you", &scope)
            .unwrap();
        assert_eq!(out, "Please do not delete this; Ada = you");
    }

    #[test]
    fn lenient_render_keeps_failed_tokens() {
        let ev = Evaluator::default();
        let out = ev.render_lenient("Total: {{ 'x' * 2 }} and {{name}}", &Scope::new());
        assert_eq!(out, "Total: {{'x' * 2}} and ");
    }

    #[test]
    fn computed_access_by_level() {
        let locals = map(json!({"items": ["a", "b"], "k": 1}));
        let scope = Scope::new().with_locals(&locals);
        let standard = Evaluator::new(SecurityLevel::Standard);
        assert!(standard.evaluate("items[k]", &scope).unwrap_err().is_blocked());
        let permissive = Evaluator::new(SecurityLevel::Permissive);
        assert_eq!(permissive.evaluate("items[k]", &scope).unwrap(), Value::from("b"));
        assert!(
            permissive
                .evaluate("items['constr' + 'uctor']", &scope)
                .unwrap_err()
                .is_blocked()
        );
    }

    #[test]
    fn host_functions() {
        let functions = FunctionTable::new()
            .with("shout", |args| {
                Ok(Value::String(
                    args.first().map(Value::display).unwrap_or_default().to_uppercase() + "!",
                ))
            })
            .unwrap();
        let ev = Evaluator::with_functions(SecurityLevel::Standard, functions);
        assert_eq!(ev.evaluate("shout('hi')", &Scope::new()).unwrap(), Value::from("HI!"));
    }

    #[test]
    fn json_values_evaluate_recursively() {
        let locals = map(json!({"n": 2}));
        let scope = Scope::new().with_locals(&locals);
        let ev = Evaluator::default();
        let v = ev
            .evaluate_json(&json!({"count": "{{n}}", "label": "plain", "list": ["{{ n * 2 }}"]}), &scope)
            .unwrap();
        assert_eq!(v.to_json(), json!({"count": 2, "label": "plain", "list": [4]}));
    }

    #[test]
    fn check_reports_static_errors() {
        let ev = Evaluator::default();
        assert!(ev.check("{{ a > 1 }}").is_ok());
        assert!(ev.check("Hello {{name}}").is_ok());
        assert_eq!(ev.check("a >").unwrap_err().code(), EvalErrorCode::Syntax);
        assert!(ev.check("Hi {{ eval('x') }}").unwrap_err().is_blocked());
    }
}
