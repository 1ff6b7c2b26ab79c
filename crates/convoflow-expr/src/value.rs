//! Runtime values.
//!
//! [`Value`] mirrors JSON with one addition: [`Value::Undefined`], the typed
//! sentinel produced when a variable or property does not exist.  Values
//! round-trip through [`serde_json::Value`] so that flow variables can be
//! stored in plain-data sessions; `Undefined` becomes `null` on the way out.
//!
//! # Numeric parsing
//!
//! Arithmetic never coerces implicitly.  The single numeric-parse rule is
//! [`Value::to_number`]: numbers pass through, strings are trimmed and must
//! be a complete decimal literal (`"42"`, `"-3.5"`, `"1e3"`), and every other
//! type is rejected.

use indexmap::IndexMap;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A runtime value produced by expression evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// A missing variable or property.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    /// An insertion-ordered object.
    Object(IndexMap<String, Value>),
}

impl Value {
    /// The type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Truthiness: `false`, `0`, `NaN`, `""`, `null` and `undefined` are
    /// falsy; everything else (including empty arrays and objects) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Array(_) | Self::Object(_) => true,
        }
    }

    /// `true` for `null` and `undefined`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// The documented numeric-parse rule.
    ///
    /// Returns `None` when the value cannot be read as a number.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => parse_decimal(s),
            _ => None,
        }
    }

    /// Canonical display form used by templates and string concatenation.
    ///
    /// `undefined` and `null` render as the empty string so that a missing
    /// value never leaks a programming term into user-facing text.
    pub fn display(&self) -> String {
        match self {
            Self::Undefined | Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Array(items) => items
                .iter()
                .map(Value::display)
                .collect::<Vec<_>>()
                .join(", "),
            Self::Object(_) => self.to_json().to_string(),
        }
    }

    /// Read a property the way member access does.
    ///
    /// Objects yield their field (or `Undefined`), strings and arrays expose
    /// `length`, arrays also accept numeric indices.  Returns `None` when the
    /// receiver is `null` or `undefined`.
    pub fn property(&self, name: &str) -> Option<Value> {
        match self {
            Self::Undefined | Self::Null => None,
            Self::Object(map) => Some(map.get(name).cloned().unwrap_or_default()),
            Self::String(s) if name == "length" => Some(Self::Number(s.chars().count() as f64)),
            Self::Array(items) => {
                if name == "length" {
                    return Some(Self::Number(items.len() as f64));
                }
                Some(
                    name.parse::<usize>()
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .unwrap_or_default(),
                )
            }
            Self::String(s) => Some(
                name.parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Self::String(c.to_string()))
                    .unwrap_or_default(),
            ),
            _ => Some(Self::Undefined),
        }
    }

    /// Convert into a JSON value.  `Undefined` and non-finite numbers become
    /// `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Undefined | Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(|num| {
                    if n.fract() == 0.0 && n.abs() < 9.0e15 {
                        serde_json::Value::Number(serde_json::Number::from(*n as i64))
                    } else {
                        serde_json::Value::Number(num)
                    }
                })
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::from(&value)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::Array(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a complete decimal literal.  Rejects the `inf`/`NaN` spellings that
/// `f64::from_str` would otherwise accept.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if !valid || !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

/// Render a number without a trailing `.0` for integral values.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
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
    fn numeric_parse_accepts_decimal_literals() {
        assert_eq!(Value::from("42").to_number(), Some(42.0));
        assert_eq!(Value::from(" -3.5 ").to_number(), Some(-3.5));
        assert_eq!(Value::from("1e3").to_number(), Some(1000.0));
    }

    #[test]
    fn numeric_parse_rejects_everything_else() {
        assert_eq!(Value::from("").to_number(), None);
        assert_eq!(Value::from("12abc").to_number(), None);
        assert_eq!(Value::from("inf").to_number(), None);
        assert_eq!(Value::from("NaN").to_number(), None);
        assert_eq!(Value::Bool(true).to_number(), None);
        assert_eq!(Value::Null.to_number(), None);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Value::Number(3.0).display(), "3");
        assert_eq!(Value::Number(2.5).display(), "2.5");
        assert_eq!(Value::Undefined.display(), "");
        assert_eq!(
            Value::Array(vec![Value::from("a"), Value::Number(1.0)]).display(),
            "a, 1"
        );
    }

    #[test]
    fn truthiness() {
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
        assert!(Value::from("0").is_truthy());
    }

    #[test]
    fn json_conversion_keeps_integers_integral() {
        let v = Value::from(json!({"count": 3, "ratio": 0.5, "tags": ["x"]}));
        assert_eq!(v.to_json(), json!({"count": 3, "ratio": 0.5, "tags": ["x"]}));
        assert_eq!(Value::Undefined.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn property_access() {
        let v = Value::from(json!({"name": "Ada", "items": [1, 2]}));
        assert_eq!(v.property("name"), Some(Value::from("Ada")));
        assert_eq!(v.property("missing"), Some(Value::Undefined));
        let items = v.property("items").unwrap();
        assert_eq!(items.property("length"), Some(Value::Number(2.0)));
        assert_eq!(items.property("1"), Some(Value::Number(2.0)));
        assert_eq!(Value::Null.property("x"), None);
    }
}
