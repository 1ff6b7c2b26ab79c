//! Variable resolution.
//!
//! A [`Scope`] borrows the three namespaces an expression can see and
//! resolves names against them in a fixed priority order:
//!
//! 1. explicit bindings (e.g. `item` inside an array filter, `args` inside
//!    an HTTP descriptor),
//! 2. flow-local variables,
//! 3. global variables,
//! 4. session cargo.
//!
//! When no layer defines them, the names `global` and `cargo` resolve to the
//! whole namespace object, so `cargo.callerId` works even if a flow variable
//! is also named `callerId`.

use indexmap::IndexMap;

use crate::value::Value;

/// A JSON object map, as stored in sessions and configuration.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Layered, read-only view of the variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    bindings: IndexMap<String, Value>,
    locals: Option<&'a JsonMap>,
    globals: Option<&'a JsonMap>,
    cargo: Option<&'a JsonMap>,
}

impl<'a> Scope<'a> {
    /// An empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the flow-local variable environment.
    pub fn with_locals(mut self, locals: &'a JsonMap) -> Self {
        self.locals = Some(locals);
        self
    }

    /// Attach the engine's global variables.
    pub fn with_globals(mut self, globals: &'a JsonMap) -> Self {
        self.globals = Some(globals);
        self
    }

    /// Attach the session cargo bag.
    pub fn with_cargo(mut self, cargo: &'a JsonMap) -> Self {
        self.cargo = Some(cargo);
        self
    }

    /// Add an explicit binding that shadows every other layer.
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Resolve a bare identifier.  Returns `None` when no layer defines it.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.bindings.get(name) {
            return Some(v.clone());
        }
        for layer in [self.locals, self.globals, self.cargo].into_iter().flatten() {
            if let Some(v) = layer.get(name) {
                return Some(Value::from(v));
            }
        }
        match name {
            "global" => self.globals.map(|g| Value::from(&serde_json::Value::Object(g.clone()))),
            "cargo" => self.cargo.map(|c| Value::from(&serde_json::Value::Object(c.clone()))),
            _ => None,
        }
    }

    /// Resolve a dotted path by pure lookup.  Any missing segment yields
    /// [`Value::Undefined`].
    pub fn resolve_path<S: AsRef<str>>(&self, path: &[S]) -> Value {
        let Some((head, rest)) = path.split_first() else {
            return Value::Undefined;
        };
        let mut current = self.lookup(head.as_ref()).unwrap_or_default();
        for segment in rest {
            current = current.property(segment.as_ref()).unwrap_or_default();
            if matches!(current, Value::Undefined) {
                break;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn priority_is_local_then_global_then_cargo() {
        let locals = map(json!({"name": "local"}));
        let globals = map(json!({"name": "global", "brand": "Acme"}));
        let cargo = map(json!({"name": "cargo", "brand": "Other", "callerId": "555"}));
        let scope = Scope::new()
            .with_locals(&locals)
            .with_globals(&globals)
            .with_cargo(&cargo);

        assert_eq!(scope.lookup("name"), Some(Value::from("local")));
        assert_eq!(scope.lookup("brand"), Some(Value::from("Acme")));
        assert_eq!(scope.lookup("callerId"), Some(Value::from("555")));
        assert_eq!(scope.lookup("nope"), None);
    }

    #[test]
    fn namespace_objects_are_addressable() {
        let locals = map(json!({"brand": "flow"}));
        let cargo = map(json!({"brand": "cargo"}));
        let scope = Scope::new().with_locals(&locals).with_cargo(&cargo);
        assert_eq!(scope.resolve_path(&["cargo", "brand"]), Value::from("cargo"));
    }

    #[test]
    fn bindings_shadow_layers() {
        let locals = map(json!({"item": 1}));
        let scope = Scope::new().with_locals(&locals).bind("item", Value::Number(2.0));
        assert_eq!(scope.lookup("item"), Some(Value::Number(2.0)));
    }

    #[test]
    fn missing_path_is_undefined() {
        let locals = map(json!({"user": {"name": "Ada"}}));
        let scope = Scope::new().with_locals(&locals);
        assert_eq!(scope.resolve_path(&["user", "name"]), Value::from("Ada"));
        assert_eq!(scope.resolve_path(&["user", "email", "domain"]), Value::Undefined);
        assert_eq!(scope.resolve_path(&["ghost"]), Value::Undefined);
    }
}
