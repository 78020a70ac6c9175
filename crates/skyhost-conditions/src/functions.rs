//! Host-provided functions callable from conditions

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConditionError, Result};

type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Functions a condition may call. Each Environment builds its own registry
/// so predicates like `file_exists` are bound to that server.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, HostFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in helpers (`size`)
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("size", |args| {
            let [value] = args else {
                return Err(arity("size", 1, args.len()));
            };
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ConditionError::type_error(format!(
                        "size() not defined for {}",
                        other
                    )))
                }
            };
            Ok(Value::from(len))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    /// Register a one-string-argument predicate
    pub fn register_predicate<F>(&mut self, name: &'static str, f: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.register(name, move |args| match args {
            [Value::String(s)] => Ok(Value::Bool(f(s))),
            [_] => Err(ConditionError::type_error(format!(
                "{}() expects a string",
                name
            ))),
            _ => Err(arity(name, 1, args.len())),
        });
    }

    /// Register a zero-argument predicate
    pub fn register_flag<F>(&mut self, name: &'static str, f: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.register(name, move |args| {
            if !args.is_empty() {
                return Err(arity(name, 0, args.len()));
            }
            Ok(Value::Bool(f()))
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| ConditionError::UnknownFunction(name.to_string()))?;
        f(args)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

fn arity(name: &str, expected: usize, got: usize) -> ConditionError {
    ConditionError::Function {
        name: name.to_string(),
        message: format!("expected {} argument(s), got {}", expected, got),
    }
}
