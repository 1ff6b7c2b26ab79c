//! Parameter-schema validation.
//!
//! Tool parameters are described with JSON Schema draft 7.  Before
//! validation, declared `default` values fill any property the caller left
//! out, so optional parameters always reach the implementation.

use jsonschema::{Draft, JSONSchema};

use convoflow_expr::JsonMap;

use crate::error::{Result, ToolError};

/// A compiled parameter schema.
pub struct ParameterSchema {
    raw: serde_json::Value,
    compiled: JSONSchema,
}

impl std::fmt::Debug for ParameterSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSchema").field("raw", &self.raw).finish()
    }
}

impl ParameterSchema {
    /// Compile `schema` for the tool `tool_id`.
    pub fn compile(tool_id: &str, schema: &serde_json::Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| ToolError::Definition {
                tool_id: tool_id.to_string(),
                reason: format!("parameter schema does not compile: {e}"),
            })?;
        Ok(Self {
            raw: schema.clone(),
            compiled,
        })
    }

    /// Declared property names, in declaration order.
    pub fn property_names(&self) -> Vec<&str> {
        self.raw
            .get("properties")
            .and_then(serde_json::Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Fill declared defaults into `args`, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Validation`] listing every schema violation.
    pub fn prepare(&self, tool_id: &str, mut args: JsonMap) -> Result<JsonMap> {
        if let Some(props) = self.raw.get("properties").and_then(serde_json::Value::as_object) {
            for (name, spec) in props {
                if args.get(name).is_none_or(serde_json::Value::is_null)
                    && let Some(default) = spec.get("default")
                {
                    args.insert(name.clone(), default.clone());
                }
            }
        }

        let instance = serde_json::Value::Object(args);
        if let Err(errors) = self.compiled.validate(&instance) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            return Err(ToolError::Validation {
                tool_id: tool_id.to_string(),
                reason: messages.join(", "),
            });
        }

        match instance {
            serde_json::Value::Object(args) => Ok(args),
            _ => Ok(JsonMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParameterSchema {
        ParameterSchema::compile(
            "t",
            &json!({
                "type": "object",
                "properties": {
                    "phone": { "type": "string", "pattern": "^\\+[0-9]{7,15}$" },
                    "count": { "type": "integer", "minimum": 1, "maximum": 5, "default": 1 }
                },
                "required": ["phone"]
            }),
        )
        .unwrap()
    }

    fn args(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_fill_missing_optionals() {
        let out = schema().prepare("t", args(json!({"phone": "+15550100"}))).unwrap();
        assert_eq!(out.get("count"), Some(&json!(1)));
    }

    #[test]
    fn violations_are_reported() {
        let s = schema();
        assert!(s.prepare("t", args(json!({}))).is_err());
        assert!(s.prepare("t", args(json!({"phone": "555"}))).is_err());
        let err = s
            .prepare("t", args(json!({"phone": "+15550100", "count": 9})))
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[test]
    fn property_names_keep_order() {
        assert_eq!(schema().property_names(), vec!["phone", "count"]);
    }

    #[test]
    fn bad_schema_is_a_definition_error() {
        let err = ParameterSchema::compile("t", &json!({"type": 12})).unwrap_err();
        assert!(matches!(err, ToolError::Definition { .. }));
    }
}
