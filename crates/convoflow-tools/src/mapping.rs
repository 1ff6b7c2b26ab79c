//! Declarative response mapping.
//!
//! A [`ResponseMapping`] reshapes a raw tool payload into the value stored
//! in the flow variable.  Mappings nest: an `object` mapping's fields and an
//! `array` mapping's items are themselves mappings.
//!
//! | `type` | Effect |
//! |--------|--------|
//! | `object` | build an object, one mapping per output field |
//! | `jsonPath` | extract one value, with `fallback` and `transform` |
//! | `array` | select an array, then `filter`, `sort`, `limit`, map each `item` |
//! | `conditional` | the first branch whose `when` holds picks the mapping |
//! | `template` | render a `{{...}}` string against the payload |
//!
//! Paths use `$.a.b[0].c`, `a.b.0` or `items[*].price` syntax.  Expressions
//! (filters, conditions, templates) see the payload as `data`, its
//! top-level fields by name, and inside arrays the current element as
//! `item`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use convoflow_expr::{Evaluator, Scope, Value};

/// Reason a mapping failed; wrapped into `ToolError::Mapping` by the invoker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MappingError(pub String);

type MapResult<T> = std::result::Result<T, MappingError>;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Response mapping descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseMapping {
    Object {
        fields: IndexMap<String, FieldMapping>,
    },
    #[serde(rename_all = "camelCase")]
    JsonPath {
        path: String,
        #[serde(default)]
        fallback: Option<serde_json::Value>,
        #[serde(default)]
        transform: Option<Transform>,
    },
    #[serde(rename_all = "camelCase")]
    Array {
        /// Path to the array; the payload itself when absent.
        #[serde(default)]
        source: Option<String>,
        /// Condition evaluated per element with `item` bound.
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        sort: Option<SortSpec>,
        #[serde(default)]
        limit: Option<usize>,
        /// Mapping applied to each element.
        #[serde(default)]
        item: Option<Box<ResponseMapping>>,
    },
    Conditional {
        branches: Vec<ConditionalBranch>,
        #[serde(default)]
        default: Option<Box<ResponseMapping>>,
    },
    Template {
        template: String,
    },
}

/// A field of an `object` mapping: a bare path, a leaf with fallback and
/// transform, or a nested mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldMapping {
    Path(String),
    Nested(Box<ResponseMapping>),
    Leaf(LeafMapping),
}

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafMapping {
    pub path: String,
    #[serde(default)]
    pub fallback: Option<serde_json::Value>,
    #[serde(default)]
    pub transform: Option<Transform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    pub when: String,
    pub mapping: ResponseMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Element path to sort by; the element itself when absent.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Post-extraction transform.  Expressions see the extracted value as
/// `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Transform {
    /// Parse as a number, optionally rounding.
    Number {
        #[serde(default)]
        decimals: Option<u32>,
    },
    /// Reformat a date or timestamp with a `strftime` pattern.
    #[serde(rename_all = "camelCase")]
    Date {
        format: String,
        /// Input pattern; RFC 3339, `%Y-%m-%d` and epoch seconds are tried
        /// when absent.
        #[serde(default)]
        input_format: Option<String>,
    },
    /// Join rendered templates.
    Concat {
        parts: Vec<String>,
        #[serde(default)]
        separator: String,
    },
    Sum {
        #[serde(default)]
        field: Option<String>,
    },
    Avg {
        #[serde(default)]
        field: Option<String>,
    },
    Min {
        #[serde(default)]
        field: Option<String>,
    },
    Max {
        #[serde(default)]
        field: Option<String>,
    },
    Count {
        #[serde(default)]
        field: Option<String>,
    },
    /// Pick one of two values by condition.
    Conditional {
        when: String,
        then: serde_json::Value,
        #[serde(default)]
        otherwise: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Applies mappings to payloads.
pub struct Mapper<'e> {
    evaluator: &'e Evaluator,
}

impl<'e> Mapper<'e> {
    pub fn new(evaluator: &'e Evaluator) -> Self {
        Self { evaluator }
    }

    /// Apply `mapping` to `payload`.
    pub fn apply(&self, mapping: &ResponseMapping, payload: &serde_json::Value) -> MapResult<serde_json::Value> {
        self.apply_in(mapping, payload, payload)
    }

    /// `node` is the value being mapped; `root` is the whole payload.
    fn apply_in(
        &self,
        mapping: &ResponseMapping,
        node: &serde_json::Value,
        root: &serde_json::Value,
    ) -> MapResult<serde_json::Value> {
        match mapping {
            ResponseMapping::Object { fields } => {
                let mut out = serde_json::Map::with_capacity(fields.len());
                for (name, field) in fields {
                    let value = match field {
                        FieldMapping::Path(path) => select(node, path).unwrap_or(serde_json::Value::Null),
                        FieldMapping::Leaf(leaf) => {
                            self.leaf(node, root, &leaf.path, leaf.fallback.as_ref(), leaf.transform.as_ref())?
                        }
                        FieldMapping::Nested(inner) => self.apply_in(inner, node, root)?,
                    };
                    out.insert(name.clone(), value);
                }
                Ok(serde_json::Value::Object(out))
            }
            ResponseMapping::JsonPath {
                path,
                fallback,
                transform,
            } => self.leaf(node, root, path, fallback.as_ref(), transform.as_ref()),
            ResponseMapping::Array {
                source,
                filter,
                sort,
                limit,
                item,
            } => {
                let selected = match source {
                    Some(path) => select(node, path),
                    None => Some(node.clone()),
                };
                let mut items = match selected {
                    Some(serde_json::Value::Array(items)) => items,
                    Some(serde_json::Value::Null) | None => Vec::new(),
                    Some(other) => {
                        return Err(MappingError(format!(
                            "expected an array at `{}`, found {}",
                            source.as_deref().unwrap_or("$"),
                            json_type(&other)
                        )));
                    }
                };
                if let Some(condition) = filter {
                    let mut kept = Vec::with_capacity(items.len());
                    for element in items {
                        let scope = payload_scope(root).bind("item", Value::from(&element));
                        let keep = self
                            .evaluator
                            .evaluate_condition(condition, &scope)
                            .map_err(|e| MappingError(format!("filter `{condition}`: {e}")))?;
                        if keep {
                            kept.push(element);
                        }
                    }
                    items = kept;
                }
                if let Some(spec) = sort {
                    sort_items(&mut items, spec);
                }
                if let Some(limit) = limit {
                    items.truncate(*limit);
                }
                if let Some(item_mapping) = item {
                    items = items
                        .iter()
                        .map(|element| self.apply_in(item_mapping, element, root))
                        .collect::<MapResult<Vec<_>>>()?;
                }
                Ok(serde_json::Value::Array(items))
            }
            ResponseMapping::Conditional { branches, default } => {
                let scope = payload_scope(root).bind("item", Value::from(node));
                for branch in branches {
                    let hit = self
                        .evaluator
                        .evaluate_condition(&branch.when, &scope)
                        .map_err(|e| MappingError(format!("condition `{}`: {e}", branch.when)))?;
                    if hit {
                        return self.apply_in(&branch.mapping, node, root);
                    }
                }
                match default {
                    Some(mapping) => self.apply_in(mapping, node, root),
                    None => Ok(serde_json::Value::Null),
                }
            }
            ResponseMapping::Template { template } => {
                let scope = payload_scope(root).bind("item", Value::from(node));
                self.evaluator
                    .evaluate_template(template, &scope)
                    .map(serde_json::Value::String)
                    .map_err(|e| MappingError(format!("template: {e}")))
            }
        }
    }

    fn leaf(
        &self,
        node: &serde_json::Value,
        root: &serde_json::Value,
        path: &str,
        fallback: Option<&serde_json::Value>,
        transform: Option<&Transform>,
    ) -> MapResult<serde_json::Value> {
        let Some(value) = select(node, path).filter(|v| !v.is_null()) else {
            return Ok(fallback.cloned().unwrap_or(serde_json::Value::Null));
        };
        match transform {
            None => Ok(value),
            Some(t) => match self.transform(t, &value, root) {
                Ok(v) => Ok(v),
                Err(e) => match fallback {
                    Some(f) => {
                        tracing::debug!(path, error = %e, "transform failed, using fallback");
                        Ok(f.clone())
                    }
                    None => Err(e),
                },
            },
        }
    }

    fn transform(
        &self,
        transform: &Transform,
        value: &serde_json::Value,
        root: &serde_json::Value,
    ) -> MapResult<serde_json::Value> {
        match transform {
            Transform::Number { decimals } => {
                let n = Value::from(value)
                    .to_number()
                    .ok_or_else(|| MappingError(format!("`{value}` is not numeric")))?;
                let n = match decimals {
                    Some(d) => {
                        let factor = 10f64.powi(*d as i32);
                        (n * factor).round() / factor
                    }
                    None => n,
                };
                Ok(Value::Number(n).to_json())
            }
            Transform::Date { format, input_format } => {
                format_date(value, format, input_format.as_deref()).map(serde_json::Value::String)
            }
            Transform::Concat { parts, separator } => {
                let scope = payload_scope(root).bind("value", Value::from(value));
                let rendered = parts
                    .iter()
                    .map(|p| self.evaluator.evaluate_template(p, &scope))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| MappingError(format!("concat: {e}")))?;
                Ok(serde_json::Value::String(rendered.join(separator)))
            }
            Transform::Sum { field } => aggregate(value, field.as_deref(), Aggregate::Sum),
            Transform::Avg { field } => aggregate(value, field.as_deref(), Aggregate::Avg),
            Transform::Min { field } => aggregate(value, field.as_deref(), Aggregate::Min),
            Transform::Max { field } => aggregate(value, field.as_deref(), Aggregate::Max),
            Transform::Count { field } => aggregate(value, field.as_deref(), Aggregate::Count),
            Transform::Conditional {
                when,
                then,
                otherwise,
            } => {
                let scope = payload_scope(root).bind("value", Value::from(value));
                let hit = self
                    .evaluator
                    .evaluate_condition(when, &scope)
                    .map_err(|e| MappingError(format!("condition `{when}`: {e}")))?;
                Ok(if hit { then.clone() } else { otherwise.clone() })
            }
        }
    }
}

/// Scope exposing the payload as `data` and its top-level fields by name.
fn payload_scope(root: &serde_json::Value) -> Scope<'static> {
    let mut scope = Scope::new().bind("data", Value::from(root));
    if let serde_json::Value::Object(fields) = root {
        for (name, value) in fields {
            if name != "data" {
                scope = scope.bind(name.clone(), Value::from(value));
            }
        }
    }
    scope
}

fn json_type(v: &serde_json::Value) -> &'static str {
    Value::from(v).type_name()
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut segments = Vec::new();
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, mut brackets) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(match key.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) if key == "*" => PathSegment::Wildcard,
                Err(_) => PathSegment::Key(key.to_string()),
            });
        }
        while let Some(rest) = brackets.strip_prefix('[') {
            let Some(close) = rest.find(']') else {
                break;
            };
            let inner = rest[..close].trim_matches(|c| c == '\'' || c == '"');
            segments.push(match inner {
                "*" => PathSegment::Wildcard,
                _ => match inner.parse::<usize>() {
                    Ok(i) => PathSegment::Index(i),
                    Err(_) => PathSegment::Key(inner.to_string()),
                },
            });
            brackets = &rest[close + 1..];
        }
    }
    segments
}

/// Extract the value at `path`.  `None` when any segment is missing.  A
/// wildcard collects the remaining path over every array element, skipping
/// elements where it is missing.
pub fn select(root: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    select_segments(root, &parse_path(path))
}

fn select_segments(node: &serde_json::Value, segments: &[PathSegment]) -> Option<serde_json::Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(node.clone());
    };
    match first {
        PathSegment::Key(key) => match node {
            serde_json::Value::Object(map) => map.get(key).and_then(|v| select_segments(v, rest)),
            serde_json::Value::Array(items) if key == "length" && rest.is_empty() => {
                Some(serde_json::Value::from(items.len()))
            }
            _ => None,
        },
        PathSegment::Index(i) => match node {
            serde_json::Value::Array(items) => items.get(*i).and_then(|v| select_segments(v, rest)),
            serde_json::Value::Object(map) => map.get(&i.to_string()).and_then(|v| select_segments(v, rest)),
            _ => None,
        },
        PathSegment::Wildcard => match node {
            serde_json::Value::Array(items) => Some(serde_json::Value::Array(
                items.iter().filter_map(|v| select_segments(v, rest)).collect(),
            )),
            serde_json::Value::Object(map) => Some(serde_json::Value::Array(
                map.values().filter_map(|v| select_segments(v, rest)).collect(),
            )),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sort_items(items: &mut [serde_json::Value], spec: &SortSpec) {
    let key = |v: &serde_json::Value| match &spec.field {
        Some(field) => select(v, field).unwrap_or(serde_json::Value::Null),
        None => v.clone(),
    };
    items.sort_by(|a, b| {
        let ordering = compare_json(&key(a), &key(b));
        match spec.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Numbers before strings before everything else; nulls last.
fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> std::cmp::Ordering {
    use serde_json::Value as J;
    use std::cmp::Ordering;
    let rank = |v: &J| match v {
        J::Number(_) => 0,
        J::String(_) => 1,
        J::Bool(_) => 2,
        J::Array(_) | J::Object(_) => 3,
        J::Null => 4,
    };
    match (a, b) {
        (J::Number(x), J::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (J::String(x), J::String(y)) => x.cmp(y),
        (J::Bool(x), J::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[derive(Debug, Clone, Copy)]
enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

fn aggregate(value: &serde_json::Value, field: Option<&str>, op: Aggregate) -> MapResult<serde_json::Value> {
    let serde_json::Value::Array(items) = value else {
        return Err(MappingError(format!("aggregate needs an array, found {}", json_type(value))));
    };
    let picked: Vec<serde_json::Value> = items
        .iter()
        .filter_map(|item| match field {
            Some(f) => select(item, f),
            None => Some(item.clone()),
        })
        .filter(|v| !v.is_null())
        .collect();
    if let Aggregate::Count = op {
        return Ok(serde_json::Value::from(picked.len()));
    }
    let numbers = picked
        .iter()
        .map(|v| {
            Value::from(v)
                .to_number()
                .ok_or_else(|| MappingError(format!("`{v}` is not numeric")))
        })
        .collect::<MapResult<Vec<f64>>>()?;
    if numbers.is_empty() {
        return Ok(match op {
            Aggregate::Sum => serde_json::Value::from(0),
            _ => serde_json::Value::Null,
        });
    }
    let sum: f64 = numbers.iter().sum();
    let result = match op {
        Aggregate::Sum => sum,
        Aggregate::Avg => sum / numbers.len() as f64,
        Aggregate::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregate::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregate::Count => numbers.len() as f64,
    };
    Ok(Value::Number(result).to_json())
}

fn format_date(value: &serde_json::Value, format: &str, input_format: Option<&str>) -> MapResult<String> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    let unparseable = || MappingError(format!("`{value}` is not a recognised date"));
    let naive: NaiveDateTime = match (value, input_format) {
        (serde_json::Value::Number(n), _) => {
            let secs = n.as_i64().ok_or_else(unparseable)?;
            DateTime::from_timestamp(secs, 0).ok_or_else(unparseable)?.naive_utc()
        }
        (serde_json::Value::String(s), Some(pattern)) => NaiveDateTime::parse_from_str(s, pattern)
            .or_else(|_| {
                NaiveDate::parse_from_str(s, pattern).map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            })
            .map_err(|_| unparseable())?,
        (serde_json::Value::String(s), None) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
            .or_else(|_| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            })
            .map_err(|_| unparseable())?,
        _ => return Err(unparseable()),
    };

    use std::fmt::Write;
    let mut out = String::new();
    write!(out, "{}", naive.format(format)).map_err(|_| MappingError(format!("invalid date format `{format}`")))?;
    Ok(out)
}
