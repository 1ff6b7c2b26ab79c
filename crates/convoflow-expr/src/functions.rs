//! Host-registered pure functions.
//!
//! Hosts may extend the method whitelist with their own functions, callable
//! by bare name (`formatPhone(caller)`).  Registration is the only way to
//! make a new call target visible to expressions; the table is built once at
//! engine construction and is immutable afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EvalError, Result};
use crate::lexer::{is_ident_continue, is_ident_start};
use crate::methods;
use crate::security;
use crate::value::Value;

/// A host-provided pure function.
pub type HostFunction = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Named host functions visible to expressions.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, HostFunction>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

impl FunctionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Blocked`] if `name` is not a plain identifier,
    /// shadows a built-in global, or is on the deny-list.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut chars = name.chars();
        let well_formed = chars.next().is_some_and(is_ident_start) && chars.all(is_ident_continue);
        if !well_formed {
            return Err(EvalError::blocked(format!(
                "`{name}` is not a valid function name"
            )));
        }
        if methods::is_global_function(&name) || name == "Math" {
            return Err(EvalError::blocked(format!(
                "`{name}` would shadow a built-in function"
            )));
        }
        security::screen(&name)?;

        tracing::debug!(function = %name, "host function registered");
        self.functions.insert(name, Arc::new(function));
        Ok(())
    }

    /// Builder-style registration.
    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Result<Self>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, function)?;
        Ok(self)
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    /// Whether a function with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_call() {
        let table = FunctionTable::new()
            .with("double", |args| {
                let n = args.first().and_then(Value::to_number).unwrap_or(0.0);
                Ok(Value::Number(n * 2.0))
            })
            .unwrap();
        let f = table.get("double").unwrap();
        assert_eq!(f(&[Value::Number(4.0)]).unwrap(), Value::Number(8.0));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut table = FunctionTable::new();
        assert!(table.register("eval", |_| Ok(Value::Null)).is_err());
        assert!(table.register("parseInt", |_| Ok(Value::Null)).is_err());
        assert!(table.register("not-an-ident", |_| Ok(Value::Null)).is_err());
        assert!(table.is_empty());
    }
}
