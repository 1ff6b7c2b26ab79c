//! The method whitelist.
//!
//! This is the closed set of call targets available to expressions besides
//! host-registered functions:
//!
//! | Receiver | Methods |
//! |----------|---------|
//! | string | `toLowerCase toUpperCase trim trimStart trimEnd slice substring split replace replaceAll includes startsWith endsWith indexOf lastIndexOf charAt padStart padEnd repeat concat` |
//! | array | `join slice includes indexOf concat reverse` |
//! | number | `toFixed toString` |
//! | global | `parseInt parseFloat Boolean String Number isNaN` |
//! | `Math` | `floor ceil round abs min max pow sqrt trunc sign` |
//!
//! String positions count Unicode scalar values.

use crate::error::{EvalError, Result};
use crate::value::{Value, format_number, parse_decimal};

const STRING_METHODS: &[&str] = &[
    "toLowerCase",
    "toUpperCase",
    "trim",
    "trimStart",
    "trimEnd",
    "slice",
    "substring",
    "split",
    "replace",
    "replaceAll",
    "includes",
    "startsWith",
    "endsWith",
    "indexOf",
    "lastIndexOf",
    "charAt",
    "padStart",
    "padEnd",
    "repeat",
    "concat",
];

const ARRAY_METHODS: &[&str] = &["join", "slice", "includes", "indexOf", "concat", "reverse"];

const NUMBER_METHODS: &[&str] = &["toFixed", "toString"];

const GLOBAL_FUNCTIONS: &[&str] = &["parseInt", "parseFloat", "Boolean", "String", "Number", "isNaN"];

const MATH_FUNCTIONS: &[&str] = &[
    "floor", "ceil", "round", "abs", "min", "max", "pow", "sqrt", "trunc", "sign",
];

/// Longest string `repeat`/`padStart`/`padEnd` may produce.
const MAX_GENERATED_LEN: usize = 10_000;

/// Whether `name` is a method on any whitelisted receiver type.
pub fn is_whitelisted_method(name: &str) -> bool {
    STRING_METHODS.contains(&name) || ARRAY_METHODS.contains(&name) || NUMBER_METHODS.contains(&name)
}

/// Whether `name` is a built-in global function.
pub fn is_global_function(name: &str) -> bool {
    GLOBAL_FUNCTIONS.contains(&name)
}

/// Whether `name` is a whitelisted `Math` function.
pub fn is_math_function(name: &str) -> bool {
    MATH_FUNCTIONS.contains(&name)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Call a whitelisted method on `receiver`.
pub fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match receiver {
        Value::String(s) if STRING_METHODS.contains(&name) => string_method(s, name, args),
        Value::Array(items) if ARRAY_METHODS.contains(&name) => array_method(items, name, args),
        Value::Number(n) if NUMBER_METHODS.contains(&name) => number_method(*n, name, args),
        Value::Undefined | Value::Null => Err(EvalError::UndefinedAccess {
            property: name.to_string(),
            target: receiver.type_name().to_string(),
        }),
        other => Err(EvalError::type_mismatch(format!(
            "`{name}` is not a method of {}",
            other.type_name()
        ))),
    }
}

/// Call a built-in global function.
pub fn call_global(name: &str, args: &[Value]) -> Result<Value> {
    let first = args.first().cloned().unwrap_or_default();
    match name {
        "parseInt" => {
            let radix = match args.get(1) {
                Some(v) => int_arg(name, v)?,
                None => 10,
            };
            if !(2..=36).contains(&radix) {
                return Err(EvalError::invalid_argument(name, "radix must be between 2 and 36"));
            }
            Ok(Value::Number(parse_int_prefix(&first.display(), radix as u32)))
        }
        "parseFloat" => Ok(Value::Number(parse_float_prefix(&first.display()))),
        "Boolean" => Ok(Value::Bool(first.is_truthy())),
        "String" => Ok(Value::String(match &first {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            other => other.display(),
        })),
        "Number" => Ok(Value::Number(explicit_number(&first))),
        "isNaN" => Ok(Value::Bool(explicit_number(&first).is_nan())),
        _ => Err(EvalError::blocked(format!("`{name}` is not a registered function"))),
    }
}

/// Call a whitelisted `Math` function.
pub fn call_math(name: &str, args: &[Value]) -> Result<Value> {
    let qualified = format!("Math.{name}");
    let nums = args
        .iter()
        .map(|v| {
            v.to_number().ok_or_else(|| {
                EvalError::invalid_argument(&qualified, format!("expected a number, got {}", v.type_name()))
            })
        })
        .collect::<Result<Vec<f64>>>()?;
    let unary = |f: fn(f64) -> f64| -> Result<f64> {
        let x = nums
            .first()
            .copied()
            .ok_or_else(|| EvalError::invalid_argument(&qualified, "expected one argument"))?;
        Ok(f(x))
    };
    let result = match name {
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "round" => unary(|x| (x + 0.5).floor()),
        "abs" => unary(f64::abs),
        "sqrt" => unary(f64::sqrt),
        "trunc" => unary(f64::trunc),
        "sign" => unary(|x| if x == 0.0 { 0.0 } else { x.signum() }),
        "min" | "max" if nums.is_empty() => {
            Err(EvalError::invalid_argument(&qualified, "expected at least one argument"))
        }
        "min" => Ok(nums.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(nums.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        "pow" => match nums.as_slice() {
            [base, exp, ..] => Ok(base.powf(*exp)),
            _ => Err(EvalError::invalid_argument(&qualified, "expected two arguments")),
        },
        _ => Err(EvalError::blocked(format!("`{qualified}` is not whitelisted"))),
    }?;
    // NaN and infinities never reach a template or a comparison.
    if result.is_finite() {
        Ok(Value::Number(result))
    } else {
        Err(EvalError::arithmetic(format!("`{qualified}` produced a non-finite result")))
    }
}

/// JS-style explicit `Number(x)` conversion: booleans map to 0/1, `null` and
/// the empty string to 0, unparseable input to NaN.
fn explicit_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null => 0.0,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => parse_decimal(s).unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

// ---------------------------------------------------------------------------
// String methods
// ---------------------------------------------------------------------------

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    match name {
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "trim" => Ok(Value::String(s.trim().to_string())),
        "trimStart" => Ok(Value::String(s.trim_start().to_string())),
        "trimEnd" => Ok(Value::String(s.trim_end().to_string())),
        "slice" => {
            let start = relative_index(opt_int_arg(name, args.first())?.unwrap_or(0), len);
            let end = relative_index(opt_int_arg(name, args.get(1))?.unwrap_or(len), len);
            Ok(Value::String(char_range(&chars, start, end)))
        }
        "substring" => {
            let clamp = |v: i64| v.clamp(0, len) as usize;
            let mut start = clamp(opt_int_arg(name, args.first())?.unwrap_or(0));
            let mut end = clamp(opt_int_arg(name, args.get(1))?.unwrap_or(len));
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            Ok(Value::String(char_range(&chars, start, end)))
        }
        "split" => {
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::Undefined) => vec![Value::String(s.to_string())],
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        chars.iter().map(|c| Value::String(c.to_string())).collect()
                    } else {
                        s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
                    }
                }
            };
            let limit = opt_int_arg(name, args.get(1))?
                .map(|l| l.max(0) as usize)
                .unwrap_or(usize::MAX);
            Ok(Value::Array(parts.into_iter().take(limit).collect()))
        }
        "replace" | "replaceAll" => {
            let pattern = str_arg(name, args.first().unwrap_or(&Value::Undefined))?;
            let replacement = args.get(1).map(Value::display).unwrap_or_default();
            let out = if name == "replace" {
                s.replacen(pattern.as_str(), &replacement, 1)
            } else if pattern.is_empty() {
                return Err(EvalError::invalid_argument(name, "pattern must not be empty"));
            } else {
                s.replace(pattern.as_str(), &replacement)
            };
            Ok(Value::String(out))
        }
        "includes" => {
            let needle = str_arg(name, args.first().unwrap_or(&Value::Undefined))?;
            Ok(Value::Bool(s.contains(needle.as_str())))
        }
        "startsWith" => {
            let needle = str_arg(name, args.first().unwrap_or(&Value::Undefined))?;
            let from = opt_int_arg(name, args.get(1))?.unwrap_or(0).clamp(0, len) as usize;
            let rest: String = chars[from..].iter().collect();
            Ok(Value::Bool(rest.starts_with(needle.as_str())))
        }
        "endsWith" => {
            let needle = str_arg(name, args.first().unwrap_or(&Value::Undefined))?;
            let end = opt_int_arg(name, args.get(1))?.unwrap_or(len).clamp(0, len) as usize;
            let head: String = chars[..end].iter().collect();
            Ok(Value::Bool(head.ends_with(needle.as_str())))
        }
        "indexOf" | "lastIndexOf" => {
            let needle: Vec<char> = str_arg(name, args.first().unwrap_or(&Value::Undefined))?
                .chars()
                .collect();
            let found = find_chars(&chars, &needle, name == "lastIndexOf");
            Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
        }
        "charAt" => {
            let i = opt_int_arg(name, args.first())?.unwrap_or(0);
            let c = usize::try_from(i).ok().and_then(|i| chars.get(i));
            Ok(Value::String(c.map(|c| c.to_string()).unwrap_or_default()))
        }
        "padStart" | "padEnd" => {
            let target = opt_int_arg(name, args.first())?.unwrap_or(0).max(0) as usize;
            if target > MAX_GENERATED_LEN {
                return Err(EvalError::invalid_argument(name, "target length too large"));
            }
            let fill = match args.get(1) {
                Some(v) => str_arg(name, v)?,
                None => " ".to_string(),
            };
            if target <= chars.len() || fill.is_empty() {
                return Ok(Value::String(s.to_string()));
            }
            let padding: String = fill.chars().cycle().take(target - chars.len()).collect();
            Ok(Value::String(if name == "padStart" {
                format!("{padding}{s}")
            } else {
                format!("{s}{padding}")
            }))
        }
        "repeat" => {
            let count = opt_int_arg(name, args.first())?.unwrap_or(0);
            if count < 0 {
                return Err(EvalError::invalid_argument(name, "count must be non-negative"));
            }
            if (count as usize).saturating_mul(chars.len()) > MAX_GENERATED_LEN {
                return Err(EvalError::invalid_argument(name, "result too large"));
            }
            Ok(Value::String(s.repeat(count as usize)))
        }
        "concat" => {
            let mut out = s.to_string();
            for a in args {
                out.push_str(&a.display());
            }
            Ok(Value::String(out))
        }
        _ => Err(EvalError::type_mismatch(format!("`{name}` is not a method of string"))),
    }
}

// ---------------------------------------------------------------------------
// Array methods
// ---------------------------------------------------------------------------

fn array_method(items: &[Value], name: &str, args: &[Value]) -> Result<Value> {
    let len = items.len() as i64;
    match name {
        "join" => {
            let sep = match args.first() {
                None | Some(Value::Undefined) => ",".to_string(),
                Some(v) => str_arg(name, v)?,
            };
            Ok(Value::String(
                items.iter().map(Value::display).collect::<Vec<_>>().join(&sep),
            ))
        }
        "slice" => {
            let start = relative_index(opt_int_arg(name, args.first())?.unwrap_or(0), len);
            let end = relative_index(opt_int_arg(name, args.get(1))?.unwrap_or(len), len);
            Ok(Value::Array(if start < end {
                items[start..end].to_vec()
            } else {
                Vec::new()
            }))
        }
        "includes" => {
            let needle = args.first().cloned().unwrap_or_default();
            Ok(Value::Bool(items.iter().any(|v| *v == needle)))
        }
        "indexOf" => {
            let needle = args.first().cloned().unwrap_or_default();
            Ok(Value::Number(
                items
                    .iter()
                    .position(|v| *v == needle)
                    .map_or(-1.0, |i| i as f64),
            ))
        }
        "concat" => {
            let mut out = items.to_vec();
            for a in args {
                match a {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }
        "reverse" => Ok(Value::Array(items.iter().rev().cloned().collect())),
        _ => Err(EvalError::type_mismatch(format!("`{name}` is not a method of array"))),
    }
}

// ---------------------------------------------------------------------------
// Number methods
// ---------------------------------------------------------------------------

fn number_method(n: f64, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "toFixed" => {
            let digits = opt_int_arg(name, args.first())?.unwrap_or(0);
            if !(0..=20).contains(&digits) {
                return Err(EvalError::invalid_argument(name, "digits must be between 0 and 20"));
            }
            Ok(Value::String(format!("{n:.*}", digits as usize)))
        }
        "toString" => Ok(Value::String(format_number(n))),
        _ => Err(EvalError::type_mismatch(format!("`{name}` is not a method of number"))),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn str_arg(function: &str, v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) => Ok(v.display()),
        other => Err(EvalError::invalid_argument(
            function,
            format!("expected a string, got {}", other.type_name()),
        )),
    }
}

fn int_arg(function: &str, v: &Value) -> Result<i64> {
    v.to_number()
        .filter(|n| n.is_finite())
        .map(|n| n.trunc() as i64)
        .ok_or_else(|| {
            EvalError::invalid_argument(function, format!("expected an integer, got {}", v.type_name()))
        })
}

fn opt_int_arg(function: &str, v: Option<&Value>) -> Result<Option<i64>> {
    match v {
        None | Some(Value::Undefined) => Ok(None),
        Some(v) => int_arg(function, v).map(Some),
    }
}

/// Resolve a possibly negative index against `len`, clamped to `0..=len`.
fn relative_index(i: i64, len: i64) -> usize {
    let resolved = if i < 0 { len + i } else { i };
    resolved.clamp(0, len) as usize
}

fn char_range(chars: &[char], start: usize, end: usize) -> String {
    if start >= end {
        String::new()
    } else {
        chars[start..end].iter().collect()
    }
}

fn find_chars(haystack: &[char], needle: &[char], last: bool) -> Option<usize> {
    if needle.is_empty() {
        return Some(if last { haystack.len() } else { 0 });
    }
    if needle.len() > haystack.len() {
        return None;
    }
    let mut positions = (0..=haystack.len() - needle.len()).filter(|&i| haystack[i..i + needle.len()] == *needle);
    if last { positions.last() } else { positions.next() }
}

fn parse_int_prefix(text: &str, radix: u32) -> f64 {
    let t = text.trim_start();
    let (sign, digits) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    let digits = if radix == 16 {
        digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits)
    } else {
        digits
    };
    let prefix: String = digits.chars().take_while(|c| c.is_digit(radix)).collect();
    if prefix.is_empty() {
        return f64::NAN;
    }
    let mut acc = 0.0_f64;
    for c in prefix.chars() {
        acc = acc * f64::from(radix) + f64::from(c.to_digit(radix).unwrap_or(0));
    }
    sign * acc
}

fn parse_float_prefix(text: &str) -> f64 {
    let t = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_digit = false;
    for (i, c) in t.char_indices() {
        match c {
            '+' | '-' if i == 0 => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end = i + c.len_utf8();
    }
    if !seen_digit {
        return f64::NAN;
    }
    t[..end].parse::<f64>().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[test]
    fn string_slicing_matches_reference_semantics() {
        assert_eq!(string_method("hello", "slice", &[Value::Number(1.0), Value::Number(3.0)]).unwrap(), s("el"));
        assert_eq!(string_method("hello", "slice", &[Value::Number(-3.0)]).unwrap(), s("llo"));
        assert_eq!(string_method("hello", "substring", &[Value::Number(3.0), Value::Number(1.0)]).unwrap(), s("el"));
        assert_eq!(string_method("héllo", "charAt", &[Value::Number(1.0)]).unwrap(), s("é"));
    }

    #[test]
    fn split_and_join() {
        let parts = string_method("a,b,c", "split", &[s(",")]).unwrap();
        assert_eq!(parts, Value::Array(vec![s("a"), s("b"), s("c")]));
        let Value::Array(items) = parts else { unreachable!() };
        assert_eq!(array_method(&items, "join", &[s("-")]).unwrap(), s("a-b-c"));
    }

    #[test]
    fn replace_first_vs_all() {
        assert_eq!(string_method("a-a-a", "replace", &[s("a"), s("b")]).unwrap(), s("b-a-a"));
        assert_eq!(string_method("a-a-a", "replaceAll", &[s("a"), s("b")]).unwrap(), s("b-b-b"));
    }

    #[test]
    fn index_of_counts_chars() {
        assert_eq!(string_method("añb", "indexOf", &[s("b")]).unwrap(), Value::Number(2.0));
        assert_eq!(string_method("abab", "lastIndexOf", &[s("ab")]).unwrap(), Value::Number(2.0));
        assert_eq!(string_method("abc", "indexOf", &[s("z")]).unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn padding_and_repeat() {
        assert_eq!(string_method("7", "padStart", &[Value::Number(3.0), s("0")]).unwrap(), s("007"));
        assert_eq!(string_method("ab", "repeat", &[Value::Number(2.0)]).unwrap(), s("abab"));
        assert!(string_method("ab", "repeat", &[Value::Number(1e9)]).is_err());
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_method(3.14159, "toFixed", &[Value::Number(2.0)]).unwrap(), s("3.14"));
        assert_eq!(number_method(10.0, "toString", &[]).unwrap(), s("10"));
    }

    #[test]
    fn globals() {
        assert_eq!(call_global("parseInt", &[s("42px")]).unwrap(), Value::Number(42.0));
        assert_eq!(call_global("parseInt", &[s("ff"), Value::Number(16.0)]).unwrap(), Value::Number(255.0));
        assert_eq!(call_global("parseFloat", &[s("3.5kg")]).unwrap(), Value::Number(3.5));
        assert_eq!(call_global("Number", &[Value::Bool(true)]).unwrap(), Value::Number(1.0));
        assert_eq!(call_global("isNaN", &[s("abc")]).unwrap(), Value::Bool(true));
        assert_eq!(call_global("Boolean", &[s("")]).unwrap(), Value::Bool(false));
        assert_eq!(call_global("String", &[Value::Number(5.0)]).unwrap(), s("5"));
    }

    #[test]
    fn math() {
        assert_eq!(call_math("round", &[Value::Number(2.5)]).unwrap(), Value::Number(3.0));
        assert_eq!(call_math("max", &[Value::Number(1.0), s("7"), Value::Number(3.0)]).unwrap(), Value::Number(7.0));
        assert_eq!(call_math("pow", &[Value::Number(2.0), Value::Number(10.0)]).unwrap(), Value::Number(1024.0));
        assert!(call_math("floor", &[s("abc")]).is_err());
        assert!(call_math("random", &[]).unwrap_err().is_blocked());
    }

    #[test]
    fn math_rejects_non_finite_results() {
        let err = call_math("sqrt", &[Value::Number(-1.0)]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::Arithmetic);
        let err = call_math("pow", &[Value::Number(10.0), Value::Number(400.0)]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::Arithmetic);
        let err = call_math("floor", &[Value::Number(f64::NAN)]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::Arithmetic);
    }

    #[test]
    fn math_min_max_need_an_argument() {
        let err = call_math("max", &[]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::InvalidArgument);
        let err = call_math("min", &[]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::InvalidArgument);
        assert_eq!(call_math("min", &[Value::Number(4.0)]).unwrap(), Value::Number(4.0));
    }

    #[test]
    fn wrong_receiver_is_type_mismatch() {
        let err = call_method(&Value::Number(1.0), "trim", &[]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::TypeMismatch);
        let err = call_method(&Value::Undefined, "trim", &[]).unwrap_err();
        assert_eq!(err.code(), crate::EvalErrorCode::UndefinedAccess);
    }
}
