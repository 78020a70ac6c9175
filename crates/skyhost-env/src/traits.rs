//! Executor trait and per-run execution data

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use skyhost_core::{
    replace_tokens, replace_tokens_in_list, Bindings, EnvironmentKind, Result, ServerStats,
    StdinConfiguration,
};

use crate::state::EnvState;

/// Invoked once with the exit code when the process ends
pub type ExitCallback = Box<dyn FnOnce(i32) + Send + Sync>;

/// Everything needed to start one process
#[derive(Default)]
pub struct ExecutionData {
    pub command: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Relative to the server root; empty means the root itself
    pub working_directory: String,
    /// Bindings for `${name}` substitution in command, arguments and environment
    pub variables: Bindings,
    pub callback: Option<ExitCallback>,
    pub stdin: StdinConfiguration,
    pub disable_stats: bool,
}

impl std::fmt::Debug for ExecutionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionData")
            .field("command", &self.command)
            .field("arguments", &self.arguments)
            .field("working_directory", &self.working_directory)
            .field("stdin", &self.stdin)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ExecutionData {
    pub fn new(command: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            command: command.into(),
            arguments,
            ..Default::default()
        }
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_variables(mut self, variables: Bindings) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_stdin(mut self, stdin: StdinConfiguration) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn on_exit<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(i32) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Apply token substitution with the attached variables
    pub fn substitute_tokens(&mut self) {
        if self.variables.is_empty() {
            return;
        }
        self.command = replace_tokens(&self.command, &self.variables);
        self.arguments = replace_tokens_in_list(&self.arguments, &self.variables);
        self.working_directory = replace_tokens(&self.working_directory, &self.variables);
        for value in self.environment.values_mut() {
            *value = replace_tokens(value, &self.variables);
        }
    }

    /// Command line for display
    pub fn command_string(&self) -> String {
        if self.arguments.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.arguments.join(" "))
        }
    }
}

/// A concrete way of running a server process
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start the process and return once it runs. Exit is reported through `state`.
    async fn execute_async(&self, state: Arc<EnvState>, data: ExecutionData) -> Result<()>;

    /// Hard kill; a no-op when nothing runs
    async fn kill(&self) -> Result<()>;

    async fn is_running(&self) -> bool;

    async fn stats(&self) -> Result<ServerStats>;

    /// Deliver a signal to the main process
    async fn send_code(&self, code: i32) -> Result<()>;

    /// Owner for created files; negative means leave ownership alone
    fn uid(&self) -> i32;

    fn gid(&self) -> i32;

    fn kind(&self) -> EnvironmentKind;
}
