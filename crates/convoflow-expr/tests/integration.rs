//! Integration tests for the convoflow-expr crate.
//!
//! These exercise the public evaluator API end to end: substitution,
//! security screening and the coercion rules together.

use convoflow_expr::{EvalErrorCode, Evaluator, FunctionTable, JsonMap, Scope, SecurityLevel, Value};
use serde_json::json;

fn map(v: serde_json::Value) -> JsonMap {
    v.as_object().cloned().unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Deny-list
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn deny_listed_expressions_never_yield_values() {
    let locals = map(json!({"user": {"name": "Ada"}, "n": 1}));
    let scope = Scope::new().with_locals(&locals);
    let blocked = [
        "eval('1 + 1')",
        "Function('return process')()",
        "user.constructor",
        "user['__proto__']",
        "{{ user.constructor.name }}",
        "n = 2",
        "n += 1",
        "n++",
        "new Object()",
        "delete user.name",
        "globalThis",
        "require('fs')",
        "(() => 1)()",
        "setTimeout('x', 1)",
    ];
    for level in [
        SecurityLevel::Strict,
        SecurityLevel::Standard,
        SecurityLevel::Permissive,
    ] {
        let ev = Evaluator::new(level);
        for src in blocked {
            let err = ev.evaluate(src, &scope).unwrap_err();
            assert_eq!(err.code(), EvalErrorCode::Blocked, "{level}: {src} gave {err}");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Method chains
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn whitelisted_chains_match_reference_string_processing() {
    let input = "  MixedCase Input, With Commas  ";
    let locals = map(json!({ "s": input }));
    let scope = Scope::new().with_locals(&locals);
    let ev = Evaluator::default();

    let cases: Vec<(&str, String)> = vec![
        ("s.trim().toLowerCase()", input.trim().to_lowercase()),
        ("s.trim().toUpperCase()", input.trim().to_uppercase()),
        ("s.trim().split(', ').join('|')", input.trim().split(", ").collect::<Vec<_>>().join("|")),
        ("s.trim().replace('Input', 'Output')", input.trim().replacen("Input", "Output", 1)),
        ("s.trim().slice(0, 9)", input.trim()[..9].to_string()),
    ];
    for (src, expected) in cases {
        assert_eq!(ev.evaluate(src, &scope).unwrap(), Value::String(expected), "{src}");
    }

    assert_eq!(
        ev.evaluate("s.trim().length", &scope).unwrap(),
        Value::Number(input.trim().chars().count() as f64)
    );
    assert_eq!(
        ev.evaluate("s.includes('With') && s.trim().startsWith('Mixed')", &scope).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn literal_method_chain() {
    let v = Evaluator::default()
        .evaluate("\"  MixedCase  \".trim().toLowerCase()", &Scope::new())
        .unwrap();
    assert_eq!(v, Value::from("mixedcase"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Coercion rules
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn coercion_table() {
    let ev = Evaluator::default();
    let scope = Scope::new();
    let ok: &[(&str, Value)] = &[
        ("'a' + 'b'", Value::from("ab")),
        ("'a' + 1", Value::from("a1")),
        ("1 + 2", Value::Number(3.0)),
        ("'6' / '2'", Value::Number(3.0)),
        ("'150' > 100", Value::Bool(true)),
        ("100 >= '100'", Value::Bool(true)),
        ("'b' > 'a'", Value::Bool(true)),
        ("'2' == 2", Value::Bool(true)),
        ("'2' === 2", Value::Bool(false)),
        ("'2' != 2", Value::Bool(false)),
        ("'2' !== 2", Value::Bool(true)),
        ("undefined == null", Value::Bool(true)),
        ("!''", Value::Bool(true)),
        ("-'3'", Value::Number(-3.0)),
    ];
    for (src, expected) in ok {
        assert_eq!(&ev.evaluate(src, &scope).unwrap(), expected, "{src}");
    }

    let errors: &[(&str, EvalErrorCode)] = &[
        ("'abc' - 1", EvalErrorCode::Arithmetic),
        ("'1e400' * 1", EvalErrorCode::Arithmetic),
        ("10 / 0", EvalErrorCode::DivisionByZero),
        ("'abc' > 1", EvalErrorCode::TypeMismatch),
        ("[1] < [2]", EvalErrorCode::TypeMismatch),
        ("null + 1", EvalErrorCode::TypeMismatch),
        ("undefined.x", EvalErrorCode::UndefinedAccess),
        ("'a' *", EvalErrorCode::Syntax),
    ];
    for (src, code) in errors {
        assert_eq!(ev.evaluate(src, &scope).unwrap_err().code(), *code, "{src}");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Scopes and templates
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn templates_resolve_local_then_global_then_cargo() {
    let locals = map(json!({"name": "Ada"}));
    let globals = map(json!({"brand": "Acme", "name": "Global"}));
    let cargo = map(json!({"callerId": "+15550100", "mode": "voice"}));
    let scope = Scope::new()
        .with_locals(&locals)
        .with_globals(&globals)
        .with_cargo(&cargo);
    let ev = Evaluator::default();

    let out = ev
        .evaluate_template("{{name}} at {{brand}} ({{cargo.callerId}}, {{global.name}})", &scope)
        .unwrap();
    assert_eq!(out, "Ada at Acme (+15550100, Global)");
    assert!(ev.evaluate_condition("{{mode}} === 'voice'", &scope).unwrap());
}

#[test]
fn strict_level_is_arithmetic_only() {
    let locals = map(json!({"price": "12.5", "qty": 2}));
    let scope = Scope::new().with_locals(&locals);
    let ev = Evaluator::new(SecurityLevel::Strict);
    assert_eq!(ev.evaluate("{{ price * qty }}", &scope).unwrap(), Value::Number(25.0));
    assert!(ev.evaluate("price > 1", &scope).unwrap_err().is_blocked());
    assert!(ev.evaluate("Math.floor(price)", &scope).unwrap_err().is_blocked());
}

#[test]
fn host_functions_extend_the_whitelist() {
    let functions = FunctionTable::new()
        .with("maskPhone", |args| {
            let raw = args.first().map(Value::display).unwrap_or_default();
            let tail: String = raw.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            Ok(Value::String(format!("***{tail}")))
        })
        .unwrap();
    let cargo = map(json!({"callerId": "+15550100"}));
    let scope = Scope::new().with_cargo(&cargo);
    let ev = Evaluator::with_functions(SecurityLevel::Standard, functions);
    assert_eq!(
        ev.evaluate_template("Calling from {{ maskPhone(callerId) }}", &scope).unwrap(),
        "Calling from ***0100"
    );
    // Unregistered names stay blocked.
    assert!(ev.evaluate("unmask(callerId)", &scope).unwrap_err().is_blocked());
}
