//! Security policy for expressions.
//!
//! Two gates protect every evaluation:
//!
//! 1. [`screen`] runs a fixed deny-list over the raw expression source
//!    *before* tokenizing or parsing.  String-literal contents are masked
//!    first, so `'new account'` is a harmless string while `new Foo()` is
//!    rejected.  The deny-list applies at every [`SecurityLevel`].
//! 2. [`admit`] walks the parsed AST and rejects constructs the active level
//!    does not allow, plus any call target that is neither whitelisted nor
//!    registered by the host.
//!
//! Property names that reach into object internals are also re-checked at
//! run time (see [`is_forbidden_property`]) because permissive computed
//! access can build them from strings.

use std::sync::LazyLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::ast::{Expr, UnaryOp};
use crate::error::{EvalError, Result};
use crate::functions::FunctionTable;
use crate::methods;

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// How much of the expression language is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Variable access and arithmetic only.
    Strict,
    /// Adds logical, comparison and conditional operators and the method
    /// whitelist.
    #[default]
    Standard,
    /// Additionally allows computed member access (`obj[expr]`).
    Permissive,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Standard => write!(f, "standard"),
            Self::Permissive => write!(f, "permissive"),
        }
    }
}

// ---------------------------------------------------------------------------
// Deny-list
// ---------------------------------------------------------------------------

/// Deny-list patterns and the reason reported for each.  Order matters: the
/// first matching entry supplies the reason.
const DENY_LIST: &[(&str, &str)] = &[
    (
        r"\b(constructor|prototype|__proto__|__defineGetter__|__defineSetter__|__lookupGetter__|__lookupSetter__)\b",
        "constructor/prototype access",
    ),
    (
        r"\b(eval|Function|setTimeout|setInterval|setImmediate|require|import|importScripts|execScript)\b",
        "dynamic code execution",
    ),
    (
        r"\b(globalThis|window|self|document|process|Reflect|Proxy|Object|Symbol|WebAssembly)\b",
        "access to host globals",
    ),
    (r"\bnew\b", "object construction with `new`"),
    (r"\bdelete\b", "`delete` operator"),
    (
        r"\b(function|class|this|var|let|const|async|await|yield|while|for|do|return|throw|with|export)\b",
        "statement keyword",
    ),
    (r"=>", "function definition"),
    (
        r"(\+\+|--|\+=|-=|\*=|/=|%=|&&=|\|\|=|\?\?=|\*\*=|<<=|>>=|&=|\|=|\^=)",
        "assignment",
    ),
    (r"(^|[^=!<>])=([^=]|$)", "assignment"),
    (r"[;`]", "statement separator or template literal"),
];

/// Compiled deny-list.  `None` only if a pattern fails to compile, in which
/// case every expression is rejected.
static DENY_SET: LazyLock<Option<RegexSet>> =
    LazyLock::new(|| RegexSet::new(DENY_LIST.iter().map(|(pattern, _)| *pattern)).ok());

/// Property names that are never readable, at any level.
const FORBIDDEN_PROPERTIES: &[&str] = &[
    "constructor",
    "prototype",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

/// Whether `name` is a property that may never be read.
pub fn is_forbidden_property(name: &str) -> bool {
    FORBIDDEN_PROPERTIES.contains(&name)
}

/// Run the deny-list over raw expression source.
///
/// # Errors
///
/// Returns [`EvalError::Blocked`] naming the first matching pattern.
pub fn screen(source: &str) -> Result<()> {
    let Some(deny_set) = DENY_SET.as_ref() else {
        return Err(EvalError::blocked("deny-list unavailable"));
    };
    let masked = mask_string_literals(source);
    let matches = deny_set.matches(&masked);
    if let Some(index) = matches.iter().next() {
        let reason = DENY_LIST[index].1;
        tracing::warn!(reason, "expression rejected by deny-list");
        return Err(EvalError::blocked(reason));
    }
    Ok(())
}

/// Replace the contents of quoted string literals with spaces, keeping the
/// quotes, so the deny-list only inspects code.
fn mask_string_literals(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in source.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                    out.push(' ');
                } else if c == '\\' {
                    escaped = true;
                    out.push(' ');
                } else if c == q {
                    quote = None;
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Check a parsed expression against the policy for `level`.
///
/// # Errors
///
/// Returns [`EvalError::Blocked`] for the first construct not admitted.
pub fn admit(expr: &Expr, level: SecurityLevel, functions: &FunctionTable) -> Result<()> {
    match expr {
        Expr::Literal(_) | Expr::Slot(_) | Expr::Ident(_) => Ok(()),
        Expr::Array(items) => items.iter().try_for_each(|e| admit(e, level, functions)),
        Expr::Member { object, property } => {
            if is_forbidden_property(property) {
                return Err(EvalError::blocked(format!("access to `{property}`")));
            }
            admit(object, level, functions)
        }
        Expr::Index { object, index } => {
            if level != SecurityLevel::Permissive {
                return Err(EvalError::blocked(format!(
                    "computed member access is not allowed at {level} level"
                )));
            }
            admit(object, level, functions)?;
            admit(index, level, functions)
        }
        Expr::Unary { op, operand } => {
            if *op == UnaryOp::Not && level == SecurityLevel::Strict {
                return Err(EvalError::blocked("logical operators are not allowed at strict level"));
            }
            admit(operand, level, functions)
        }
        Expr::Binary { op, left, right } => {
            if !op.is_arithmetic() && level == SecurityLevel::Strict {
                return Err(EvalError::blocked(format!(
                    "comparison `{}` is not allowed at strict level",
                    op.symbol()
                )));
            }
            admit(left, level, functions)?;
            admit(right, level, functions)
        }
        Expr::Logical { left, right, .. } => {
            if level == SecurityLevel::Strict {
                return Err(EvalError::blocked("logical operators are not allowed at strict level"));
            }
            admit(left, level, functions)?;
            admit(right, level, functions)
        }
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            if level == SecurityLevel::Strict {
                return Err(EvalError::blocked("conditionals are not allowed at strict level"));
            }
            admit(test, level, functions)?;
            admit(consequent, level, functions)?;
            admit(alternate, level, functions)
        }
        Expr::Call { callee, args } => {
            if level == SecurityLevel::Strict {
                return Err(EvalError::blocked("function calls are not allowed at strict level"));
            }
            admit_call_target(callee, level, functions)?;
            args.iter().try_for_each(|e| admit(e, level, functions))
        }
    }
}

fn admit_call_target(callee: &Expr, level: SecurityLevel, functions: &FunctionTable) -> Result<()> {
    match callee {
        Expr::Ident(name) => {
            if methods::is_global_function(name) || functions.contains(name) {
                Ok(())
            } else {
                Err(EvalError::blocked(format!(
                    "`{name}` is not a registered function"
                )))
            }
        }
        Expr::Member { object, property } => {
            if let Expr::Ident(ns) = object.as_ref()
                && ns == "Math"
            {
                return if methods::is_math_function(property) {
                    Ok(())
                } else {
                    Err(EvalError::blocked(format!("`Math.{property}` is not whitelisted")))
                };
            }
            if is_forbidden_property(property) || !methods::is_whitelisted_method(property) {
                return Err(EvalError::blocked(format!(
                    "method `{property}` is not whitelisted"
                )));
            }
            admit(object, level, functions)
        }
        _ => Err(EvalError::blocked("only named functions and whitelisted methods may be called")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;

    #[test]
    fn deny_list_compiles() {
        for (pattern, _) in DENY_LIST {
            assert!(regex::Regex::new(pattern).is_ok(), "bad pattern {pattern}");
        }
        assert_eq!(DENY_SET.as_ref().map(RegexSet::len), Some(DENY_LIST.len()));
    }

    #[test]
    fn screen_rejects_dangerous_patterns() {
        for src in [
            "eval('1')",
            "Function('return 1')()",
            "x.constructor",
            "a.__proto__.b",
            "new Date()",
            "delete user.name",
            "a = 1",
            "a += 1",
            "i++",
            "(x) => x",
            "a; b",
            "globalThis.x",
            "`tpl`",
        ] {
            let err = screen(src).unwrap_err();
            assert!(err.is_blocked(), "{src} should be blocked");
        }
    }

    #[test]
    fn screen_ignores_string_contents() {
        assert!(screen("'new account = open; eval'").is_ok());
        assert!(screen("a == 1 && b != 2 && c <= 3 && d >= 4").is_ok());
        assert!(screen("status === 'a=b'").is_ok());
    }

    #[test]
    fn strict_level_allows_arithmetic_only() {
        let f = FunctionTable::new();
        let ok = parse_expression("price * qty + fee").unwrap();
        assert!(admit(&ok, SecurityLevel::Strict, &f).is_ok());

        for src in ["a > 1", "a && b", "a ? b : c", "name.trim()", "!a"] {
            let expr = parse_expression(src).unwrap();
            assert!(admit(&expr, SecurityLevel::Strict, &f).unwrap_err().is_blocked());
        }
    }

    #[test]
    fn computed_access_requires_permissive() {
        let f = FunctionTable::new();
        let expr = parse_expression("items[0]").unwrap();
        assert!(admit(&expr, SecurityLevel::Standard, &f).is_err());
        assert!(admit(&expr, SecurityLevel::Permissive, &f).is_ok());
    }

    #[test]
    fn unknown_call_targets_are_blocked() {
        let f = FunctionTable::new();
        for src in ["fetch('x')", "name.call(1)", "Math.random()", "a()()"] {
            let expr = parse_expression(src).unwrap();
            assert!(
                admit(&expr, SecurityLevel::Permissive, &f).unwrap_err().is_blocked(),
                "{src}"
            );
        }
    }
}
