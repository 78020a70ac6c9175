//! Core types for skyhost

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Variable bindings used by token substitution and conditions
pub type Bindings = HashMap<String, Value>;

fn default_server_type() -> String {
    "standard".to_string()
}

/// Regex pattern for valid server ids: only alphanumeric, underscore, and hyphen
static SERVER_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid server id regex"));

/// Validate a server id. Ids become file and directory names, so this
/// rejects anything that could traverse out of the data directories.
pub fn validate_server_id(id: &str) -> bool {
    !id.is_empty() && SERVER_ID_REGEX.is_match(id)
}

/// Which backend runs a server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    /// Namespace-sandboxed OS process
    Process,
    /// Container managed through the container runtime
    Docker,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::Process => "tty",
            EnvironmentKind::Docker => "docker",
        }
    }
}

impl FromStr for EnvironmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tty" | "process" | "standard" => Ok(EnvironmentKind::Process),
            "docker" | "container" => Ok(EnvironmentKind::Docker),
            _ => Err(Error::config(format!("Unknown environment type: {}", s))),
        }
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A selectable value for a variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariableOption {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub display: String,
}

/// A server variable: value plus its presentation metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Variable {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display: String,
    #[serde(default, rename = "desc", skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "userEdit")]
    pub user_editable: bool,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<VariableOption>,
}

impl Variable {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_user_editable(mut self, editable: bool) -> Self {
        self.user_editable = editable;
        self
    }
}

/// Where console input of a running server comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StdinConfiguration {
    /// `telnet`, `rcon`, `rconws` or empty for the process's own stdin
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl StdinConfiguration {
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }
}

/// One operation in a pipeline definition: `{type, if?, ...arguments}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OperationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "if", skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl OperationSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }
}

/// A start command guarded by a condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConditionalCommand {
    pub command: String,
    #[serde(default, rename = "if", skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "StdinConfiguration::is_empty")]
    pub stdin: StdinConfiguration,
}

/// The start command: either a plain string or a list of guarded candidates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandLine {
    Single(String),
    Conditional(Vec<ConditionalCommand>),
}

impl Default for CommandLine {
    fn default() -> Self {
        CommandLine::Single(String::new())
    }
}

impl CommandLine {
    /// Pick the command to run. The first candidate whose condition holds
    /// wins; otherwise the first candidate without a condition is used.
    pub fn select<F>(&self, mut condition_holds: F) -> Result<ConditionalCommand>
    where
        F: FnMut(&str) -> Result<bool>,
    {
        let candidates = match self {
            CommandLine::Single(command) => {
                return Ok(ConditionalCommand {
                    command: command.clone(),
                    ..Default::default()
                })
            }
            CommandLine::Conditional(candidates) => candidates,
        };

        for candidate in candidates.iter().filter(|c| !c.condition.is_empty()) {
            if condition_holds(&candidate.condition)? {
                return Ok(candidate.clone());
            }
        }

        Ok(candidates
            .iter()
            .find(|c| c.condition.is_empty())
            .cloned()
            .unwrap_or_default())
    }
}

/// Periodic command written into a running server's console
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeepAlive {
    /// Duration such as `5m`
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub command: String,
}

impl KeepAlive {
    pub fn is_enabled(&self) -> bool {
        !self.frequency.is_empty() && !self.command.is_empty()
    }
}

/// How a server is run and stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(default)]
    pub command: CommandLine,
    #[serde(default, rename = "stop", skip_serializing_if = "String::is_empty")]
    pub stop_command: String,
    /// Signal number used to stop; takes precedence over `stop`
    #[serde(default)]
    pub stop_code: i32,
    #[serde(default, rename = "pre", skip_serializing_if = "Vec::is_empty")]
    pub pre_execution: Vec<OperationSpec>,
    #[serde(default, rename = "post", skip_serializing_if = "Vec::is_empty")]
    pub post_execution: Vec<OperationSpec>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "StdinConfiguration::is_empty")]
    pub stdin: StdinConfiguration,
    #[serde(default, rename = "autostart")]
    pub auto_start: bool,
    #[serde(default, rename = "autorestart")]
    pub auto_restart_from_graceful: bool,
    #[serde(default, rename = "autorecover")]
    pub auto_restart_from_crash: bool,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default, rename = "keepalive")]
    pub keep_alive: KeepAlive,
}

/// Backend selection plus backend specific settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::Process.as_str().to_string(),
            settings: Map::new(),
        }
    }
}

impl EnvironmentSpec {
    pub fn kind(&self) -> Result<EnvironmentKind> {
        self.kind.parse()
    }
}

/// A server definition as persisted in `<servers_dir>/<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display: String,
    #[serde(rename = "type", default = "default_server_type")]
    pub kind: String,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub data: HashMap<String, Variable>,
    #[serde(default, rename = "install")]
    pub installation: Vec<OperationSpec>,
    #[serde(default, rename = "uninstall")]
    pub uninstallation: Vec<OperationSpec>,
    #[serde(default, rename = "run")]
    pub execution: Execution,
}

impl ServerDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display: String::new(),
            kind: default_server_type(),
            environment: EnvironmentSpec::default(),
            data: HashMap::new(),
            installation: Vec::new(),
            uninstallation: Vec::new(),
            execution: Execution::default(),
        }
    }

    /// Check the fields everything else relies on
    pub fn validate(&self) -> Result<()> {
        if !validate_server_id(&self.id) {
            return Err(Error::InvalidServer(format!(
                "Invalid server id '{}': only alphanumeric characters, underscores, and hyphens are allowed",
                self.id
            )));
        }
        if self.kind.is_empty() {
            return Err(Error::InvalidServer("server type is required".into()));
        }
        if self.environment.kind.is_empty() {
            return Err(Error::InvalidServer("environment type is required".into()));
        }
        self.environment.kind()?;
        Ok(())
    }

    /// Current variable values keyed by name
    pub fn variable_values(&self) -> Bindings {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    pub fn display_name(&self) -> &str {
        if self.display.is_empty() {
            &self.id
        } else {
            &self.display
        }
    }
}

/// JVM heap figures collected through `jcmd GC.heap_info`, in bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JvmStats {
    pub heap_used: u64,
    pub heap_total: u64,
    pub metaspace_used: u64,
    pub metaspace_total: u64,
}

/// Resource usage of a running server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerStats {
    /// CPU usage in percent of one core
    pub cpu: f64,
    /// Memory usage in bytes
    pub memory: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm: Option<JvmStats>,
}

/// Running/installing state published on the status tracker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerStatus {
    pub running: bool,
    pub installing: bool,
}

/// A chunk of console output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLog {
    pub logs: String,
    /// Unix timestamp in milliseconds
    pub epoch: i64,
}

/// Message published to tracker listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Status(ServerStatus),
    Stats(ServerStats),
    Console(ConsoleLog),
}

/// Directory entry returned by file listings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileDesc {
    pub name: String,
    /// False for directories
    pub file: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub modified: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// A scheduled pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Task {
    #[serde(default)]
    pub name: String,
    /// Cron expression; empty means the task only runs on demand
    #[serde(default, rename = "cronSchedule")]
    pub cron_schedule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationSpec>,
}

/// Summary row for server listings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub id: String,
    pub display: String,
    pub environment: String,
    pub running: bool,
    pub installing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_server_id() {
        assert!(validate_server_id("abc123"));
        assert!(validate_server_id("my-server_1"));
        assert!(!validate_server_id(""));
        assert!(!validate_server_id("../etc"));
        assert!(!validate_server_id("a/b"));
        assert!(!validate_server_id("a b"));
    }

    #[test]
    fn test_environment_kind_from_str() {
        assert_eq!("tty".parse::<EnvironmentKind>().unwrap(), EnvironmentKind::Process);
        assert_eq!("docker".parse::<EnvironmentKind>().unwrap(), EnvironmentKind::Docker);
        assert!("vm".parse::<EnvironmentKind>().is_err());
    }

    #[test]
    fn test_operation_spec_flattens_arguments() {
        let spec: OperationSpec = serde_json::from_value(json!({
            "type": "writefile",
            "if": "success",
            "target": "server.properties",
            "text": "motd=${motd}"
        }))
        .unwrap();
        assert_eq!(spec.kind, "writefile");
        assert_eq!(spec.condition, "success");
        assert_eq!(spec.args["target"], json!("server.properties"));
        assert!(!spec.args.contains_key("type"));
    }

    #[test]
    fn test_server_definition_parse() {
        let def: ServerDefinition = serde_json::from_value(json!({
            "id": "abc",
            "display": "Survival",
            "environment": {"type": "docker", "image": "eclipse-temurin:21"},
            "data": {
                "memory": {"value": 1024, "userEdit": true},
                "motd": {"value": "hello", "desc": "Message of the day"}
            },
            "install": [{"type": "mkdir", "target": "world"}],
            "run": {
                "command": "java -Xmx${memory}M -jar server.jar",
                "stop": "stop",
                "autorecover": true,
                "keepalive": {"frequency": "5m", "command": "save-all"}
            }
        }))
        .unwrap();

        assert!(def.validate().is_ok());
        assert_eq!(def.environment.kind().unwrap(), EnvironmentKind::Docker);
        assert_eq!(def.environment.settings["image"], json!("eclipse-temurin:21"));
        assert!(def.data["memory"].user_editable);
        assert_eq!(def.data["motd"].description, "Message of the day");
        assert_eq!(def.installation.len(), 1);
        assert_eq!(def.execution.stop_command, "stop");
        assert!(def.execution.auto_restart_from_crash);
        assert!(!def.execution.auto_restart_from_graceful);
        assert!(def.execution.keep_alive.is_enabled());
        assert_eq!(def.variable_values()["memory"], json!(1024));
    }

    #[test]
    fn test_server_definition_rejects_bad_id() {
        let def = ServerDefinition::new("../escape");
        assert!(matches!(def.validate(), Err(Error::InvalidServer(_))));
    }

    #[test]
    fn test_command_line_single() {
        let cmd = CommandLine::Single("java -jar server.jar".into());
        let chosen = cmd.select(|_| Ok(false)).unwrap();
        assert_eq!(chosen.command, "java -jar server.jar");
    }

    #[test]
    fn test_command_line_conditional() {
        let cmd: CommandLine = serde_json::from_value(json!([
            {"command": "default"},
            {"command": "linux", "if": "core_os == \"linux\""},
            {"command": "never", "if": "false"}
        ]))
        .unwrap();

        let chosen = cmd.select(|cond| Ok(cond.contains("linux"))).unwrap();
        assert_eq!(chosen.command, "linux");

        let chosen = cmd.select(|_| Ok(false)).unwrap();
        assert_eq!(chosen.command, "default");
    }

    #[test]
    fn test_command_line_condition_error_propagates() {
        let cmd = CommandLine::Conditional(vec![ConditionalCommand {
            command: "x".into(),
            condition: "broken(".into(),
            stdin: StdinConfiguration::default(),
        }]);
        let result = cmd.select(|_| Err(Error::Condition("parse".into())));
        assert!(matches!(result, Err(Error::Condition(_))));
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::Status(ServerStatus {
            running: true,
            installing: false,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["running"], true);
    }
}
