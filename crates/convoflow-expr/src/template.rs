//! `{{...}}` template scanning and the substitution phase.
//!
//! A token whose trimmed contents match `ident(.ident)*` is a *path*: it is
//! resolved by pure lookup and never parsed.  Any other token is an
//! *expression* and is left for the evaluation phase.
//!
//! When a template is used as code (a CASE condition, for instance),
//! [`substitute`] replaces every path token with a slot marker that refers
//! to the already-resolved, typed value.  The value itself never appears in
//! the source text handed to the parser, so user-supplied strings cannot
//! become code.

use crate::error::{EvalError, Result};
use crate::lexer::{SLOT_CLOSE, SLOT_OPEN, is_ident_continue, is_ident_start};
use crate::scope::Scope;
use crate::security::is_forbidden_property;
use crate::value::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// One piece of a scanned template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text between tokens.
    Text(String),
    /// A `{{a.b.c}}` token, split on `.`.
    Path(Vec<String>),
    /// Any other `{{...}}` token; holds the trimmed inner source.
    Expression(String),
}

impl Segment {
    /// The original token text, used when a failed token stays visible.
    pub fn token_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Path(parts) => format!("{OPEN}{}{CLOSE}", parts.join(".")),
            Self::Expression(src) => format!("{OPEN}{src}{CLOSE}"),
        }
    }
}

/// Result of the substitution phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    /// Source text with every path token replaced by a slot marker.
    pub source: String,
    /// Typed values referenced by the slot markers, by index.
    pub slots: Vec<Value>,
}

/// Whether `text` contains at least one complete `{{...}}` token.
pub fn has_tokens(text: &str) -> bool {
    segments(text).iter().any(|s| !matches!(s, Segment::Text(_)))
}

/// Split a template into literal text and tokens.
///
/// An unterminated `{{` is kept as literal text.
pub fn segments(text: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        if start > 0 {
            out.push(Segment::Text(rest[..start].to_string()));
        }
        let inner = after_open[..end].trim();
        out.push(match parse_path(inner) {
            Some(parts) => Segment::Path(parts),
            None => Segment::Expression(inner.to_string()),
        });
        rest = &after_open[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest.to_string()));
    }
    out
}

/// Parse `ident(.ident)*`; `None` if `inner` is anything else.
pub fn parse_path(inner: &str) -> Option<Vec<String>> {
    let parts: Vec<String> = inner.split('.').map(str::to_string).collect();
    let valid = parts.iter().all(|p| {
        let mut chars = p.chars();
        chars.next().is_some_and(is_ident_start) && chars.all(is_ident_continue)
    });
    valid.then_some(parts)
}

/// Resolve a path token by pure lookup.
///
/// # Errors
///
/// Returns [`EvalError::Blocked`] if any segment names a forbidden property.
pub fn resolve(path: &[String], scope: &Scope<'_>) -> Result<Value> {
    if let Some(bad) = path.iter().find(|p| is_forbidden_property(p)) {
        return Err(EvalError::blocked(format!("access to `{bad}`")));
    }
    Ok(scope.resolve_path(path))
}

/// Run the substitution phase over code containing `{{...}}` tokens.
///
/// Path tokens become slots holding their resolved values (missing
/// variables become [`Value::Undefined`], not errors).  Expression tokens
/// are spliced back as parenthesized source for the evaluation phase.
///
/// # Errors
///
/// Returns [`EvalError::Blocked`] if a path names a forbidden property.
pub fn substitute(text: &str, scope: &Scope<'_>) -> Result<Substitution> {
    let mut source = String::with_capacity(text.len());
    let mut slots = Vec::new();
    for segment in segments(text) {
        match segment {
            Segment::Text(t) => source.push_str(&t),
            Segment::Path(path) => {
                let value = resolve(&path, scope)?;
                source.push(SLOT_OPEN);
                source.push_str(&slots.len().to_string());
                source.push(SLOT_CLOSE);
                slots.push(value);
            }
            Segment::Expression(inner) => {
                source.push('(');
                source.push_str(&inner);
                source.push(')');
            }
        }
    }
    Ok(Substitution { source, slots })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scans_paths_and_expressions() {
        let segs = segments("Hi {{ user.name }}, total {{price * 2}}!");
        assert_eq!(
            segs,
            vec![
                Segment::Text("Hi ".into()),
                Segment::Path(vec!["user".into(), "name".into()]),
                Segment::Text(", total ".into()),
                Segment::Expression("price * 2".into()),
                Segment::Text("!".into()),
            ]
        );
    }

    #[test]
    fn unterminated_token_is_text() {
        assert_eq!(segments("a {{ b"), vec![Segment::Text("a {{ b".into())]);
        assert!(!has_tokens("a {{ b"));
        assert!(has_tokens("{{b}}"));
    }

    #[test]
    fn path_grammar_is_restrictive() {
        assert!(parse_path("a.b_c.$d").is_some());
        assert!(parse_path("a.").is_none());
        assert!(parse_path("a[0]").is_none());
        assert!(parse_path("1a").is_none());
    }

    #[test]
    fn substitution_uses_slots_for_values() {
        let locals = json!({"answer": "x; eval('1')"});
        let locals = locals.as_object().unwrap();
        let scope = Scope::new().with_locals(locals);
        let sub = substitute("{{answer}} === 'y'", &scope).unwrap();
        assert_eq!(sub.slots, vec![Value::from("x; eval('1')")]);
        assert!(!sub.source.contains("eval"));
    }

    #[test]
    fn forbidden_path_is_blocked() {
        let scope = Scope::new();
        assert!(substitute("{{a.constructor}}", &scope).unwrap_err().is_blocked());
    }
}
