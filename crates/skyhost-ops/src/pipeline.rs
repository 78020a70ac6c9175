//! Operation pipeline: an ordered list of conditionally-gated operations
//!
//! Every step sees the bindings as they stand when it is reached: the
//! caller's variables, `rootDir`, `env`, `serverId`, `success`, plus any
//! override returned by an earlier step of the same run. Arguments and
//! environment overrides are token-substituted against those bindings
//! before the step's factory sees them. The first failing step ends the run.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, error, info};

use skyhost_conditions::{resolve_if, VARIABLE_ENV, VARIABLE_SERVER_ID, VARIABLE_SUCCESS};
use skyhost_core::{
    replace_tokens_in_map, replace_tokens_in_value, Bindings, Error, OperationSpec, Result,
};
use skyhost_env::Environment;

use crate::operation::CreateOperation;
use crate::registry::OperationRegistry;

/// Binding holding the server root on the host
pub const VARIABLE_ROOT_DIR: &str = "rootDir";

/// One step of a pipeline, before substitution
#[derive(Debug, Clone, PartialEq)]
pub struct OperationTask {
    pub kind: String,
    pub condition: String,
    pub args: Map<String, Value>,
    pub environment: HashMap<String, String>,
}

/// What a completed run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Operation types that ran, in order
    pub executed: Vec<String>,
    /// Operation types whose condition was false
    pub skipped: Vec<String>,
    /// Bindings after the last step
    pub bindings: Bindings,
}

#[derive(Debug, Clone, Default)]
pub struct OperationProcess {
    tasks: Vec<OperationTask>,
}

impl OperationProcess {
    /// Build a process from operation definitions. Every type must have a
    /// registered factory; nothing runs otherwise.
    pub fn generate(
        specs: &[OperationSpec],
        environment: &HashMap<String, String>,
        registry: &OperationRegistry,
    ) -> Result<Self> {
        let tasks = specs
            .iter()
            .map(|spec| {
                if !registry.contains(&spec.kind) {
                    return Err(Error::MissingFactory(spec.kind.clone()));
                }
                Ok(OperationTask {
                    kind: spec.kind.clone(),
                    condition: spec.condition.clone(),
                    args: spec.args.clone(),
                    environment: environment.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tasks })
    }

    pub fn tasks(&self) -> &[OperationTask] {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every step in order against `env`
    pub async fn run(
        &self,
        env: &Environment,
        registry: &OperationRegistry,
        mut bindings: Bindings,
    ) -> Result<PipelineReport> {
        bindings.insert(
            VARIABLE_ROOT_DIR.to_string(),
            Value::String(env.root().display().to_string()),
        );
        bindings.insert(VARIABLE_ENV.to_string(), Value::String(env.kind().to_string()));
        bindings.insert(VARIABLE_SERVER_ID.to_string(), Value::String(env.id().to_string()));
        bindings
            .entry(VARIABLE_SUCCESS.to_string())
            .or_insert(Value::Bool(true));

        let functions = env.functions();
        let mut report = PipelineReport::default();

        for task in &self.tasks {
            let proceed = resolve_if(&task.condition, &bindings, &functions)
                .map_err(|e| Error::Condition(e.to_string()));
            match proceed {
                Ok(true) => {}
                Ok(false) => {
                    debug!(server = %env.id(), operation = %task.kind, "condition false, skipping");
                    report.skipped.push(task.kind.clone());
                    continue;
                }
                Err(e) => return Err(fail(env, &task.kind, e)),
            }

            let args = task
                .args
                .iter()
                .map(|(k, v)| (k.clone(), replace_tokens_in_value(v, &bindings)))
                .collect();
            let create = CreateOperation {
                args,
                environment: replace_tokens_in_map(&task.environment, &bindings),
                data: bindings.clone(),
            };

            let result = match registry.create(&task.kind, create) {
                Ok(operation) => operation.run(env).await,
                Err(e) => Err(e),
            };
            let result = match result {
                Ok(result) => result,
                Err(e) => return Err(fail(env, &task.kind, e)),
            };

            debug!(server = %env.id(), operation = %task.kind, "operation complete");
            bindings.extend(result.variable_overrides);
            bindings.insert(VARIABLE_SUCCESS.to_string(), Value::Bool(true));
            report.executed.push(task.kind.clone());
        }

        info!(
            server = %env.id(),
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "pipeline finished"
        );
        report.bindings = bindings;
        Ok(report)
    }
}

fn fail(env: &Environment, kind: &str, e: Error) -> Error {
    error!(server = %env.id(), operation = %kind, error = %e, "operation failed");
    env.display_to_console(&format!("Error running {}: {}", kind, e));
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_generate_rejects_unknown_type_up_front() {
        let registry = OperationRegistry::with_defaults(reqwest::Client::new(), Path::new("/nonexistent/binaries"));
        let specs = vec![
            OperationSpec::new("mkdir").with_arg("target", "data"),
            OperationSpec::new("forgedl"),
        ];
        let result = OperationProcess::generate(&specs, &HashMap::new(), &registry);
        assert!(matches!(result, Err(Error::MissingFactory(kind)) if kind == "forgedl"));
    }

    #[test]
    fn test_generate_carries_environment() {
        let registry = OperationRegistry::with_defaults(reqwest::Client::new(), Path::new("/nonexistent/binaries"));
        let env = HashMap::from([("EULA".to_string(), "${eula}".to_string())]);
        let process = OperationProcess::generate(
            &[OperationSpec::new("console").with_arg("message", "hi").with_condition("success")],
            &env,
            &registry,
        )
        .unwrap();

        let task = &process.tasks()[0];
        assert_eq!(task.kind, "console");
        assert_eq!(task.condition, "success");
        assert_eq!(task.environment.get("EULA").map(String::as_str), Some("${eula}"));
    }
}
