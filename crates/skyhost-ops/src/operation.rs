//! Operation and factory traits

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;

use skyhost_core::{Bindings, Error, Result, StdinConfiguration};
use skyhost_env::Environment;

/// What a successful operation hands back to the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    /// Merged into the bindings of later steps in the same run
    pub variable_overrides: Bindings,
}

impl OperationResult {
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variable_overrides.insert(key.into(), value.into());
        self
    }
}

/// A single named action run against a server's Environment
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, env: &Environment) -> Result<OperationResult>;
}

/// Input handed to a factory. Arguments are already token-substituted.
#[derive(Debug, Clone, Default)]
pub struct CreateOperation {
    pub args: Map<String, Value>,
    pub environment: HashMap<String, String>,
    pub data: Bindings,
}

impl CreateOperation {
    pub fn new(args: Map<String, Value>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Required string argument
    pub fn string(&self, key: &str) -> Result<String> {
        match self.args.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::String(_)) | None => {
                Err(Error::invalid_argument(format!("missing argument '{}'", key)))
            }
            Some(other) => Err(Error::invalid_argument(format!(
                "argument '{}' must be a string, got {}",
                key, other
            ))),
        }
    }

    pub fn optional_string(&self, key: &str) -> Option<String> {
        self.args.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// A string or an array of strings; at least one entry required
    pub fn strings(&self, key: &str) -> Result<Vec<String>> {
        let values = match self.args.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::invalid_argument(format!("argument '{}' must hold strings", key))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::invalid_argument(format!(
                    "argument '{}' must be a string or list, got {}",
                    key, other
                )))
            }
            None => Vec::new(),
        };
        let values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return Err(Error::invalid_argument(format!("missing argument '{}'", key)));
        }
        Ok(values)
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.args.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn stdin(&self) -> Result<StdinConfiguration> {
        match self.args.get("stdin") {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid_argument(format!("invalid stdin: {}", e))),
            _ => Ok(StdinConfiguration::default()),
        }
    }
}

/// Validates arguments and builds an operation
pub trait OperationFactory: Send + Sync {
    fn key(&self) -> &'static str;

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>>;
}

/// Factory backed by a plain constructor function
pub struct FnFactory {
    key: &'static str,
    build: fn(CreateOperation) -> Result<Box<dyn Operation>>,
}

impl FnFactory {
    pub const fn new(key: &'static str, build: fn(CreateOperation) -> Result<Box<dyn Operation>>) -> Self {
        Self { key, build }
    }
}

impl OperationFactory for FnFactory {
    fn key(&self) -> &'static str {
        self.key
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>> {
        (self.build)(op)
    }
}
