//! skyhost conditions - a small boolean expression language
//!
//! Conditions gate pipeline steps and pick start commands. The grammar
//! covers literals, `==`/`!=`/`<`/`<=`/`>`/`>=`, `&&`/`||`/`!`, `in`,
//! `has(x.y)`, list literals, field and index selection and calls into a
//! [`FunctionRegistry`].
//!
//! Every binding is reachable both bare (`item == "x"`) and through the
//! `vars` map (`vars.item`, `vars["item"]`). No schema is needed up front.

pub mod error;
mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;

use serde_json::Value;
use std::collections::HashMap;

pub use error::{ConditionError, Result};
pub use eval::{values_equal, VARS};
pub use functions::FunctionRegistry;
pub use parser::Expr;

/// Binding holding the outcome of the previous pipeline step
pub const VARIABLE_SUCCESS: &str = "success";

/// Binding holding the environment type (`tty`, `docker`)
pub const VARIABLE_ENV: &str = "env";

/// Binding holding the server id
pub const VARIABLE_SERVER_ID: &str = "serverId";

/// A compiled condition
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn compile(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            expr: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the bindings. The result must be a boolean.
    pub fn evaluate(
        &self,
        bindings: &HashMap<String, Value>,
        functions: &FunctionRegistry,
    ) -> Result<bool> {
        let scope = eval::Scope {
            bindings,
            functions,
        };
        scope.eval_bool(&self.expr)
    }
}

/// Compile and evaluate in one go. An empty condition is always true.
pub fn resolve_if(
    source: &str,
    bindings: &HashMap<String, Value>,
    functions: &FunctionRegistry,
) -> Result<bool> {
    if source.trim().is_empty() {
        return Ok(true);
    }
    Condition::compile(source)?.evaluate(bindings, functions)
}
