//! IPC Protocol - Request/Response types
//!
//! One JSON object per line in each direction. Every request gets exactly
//! one response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use skyhost_core::{FileDesc, ServerDefinition, ServerInfo, ServerStats, ServerStatus, Task, Variable};

/// IPC Request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Check if daemon is alive
    Ping,

    /// Summary of every server
    List,

    /// Register a new server, optionally installing it right away
    Create {
        definition: ServerDefinition,
        #[serde(default)]
        install: bool,
    },

    /// Uninstall and remove a server
    Delete { id: String },

    Start { id: String },

    /// Ask a server to stop; `wait` blocks until it exited
    Stop {
        id: String,
        #[serde(default)]
        wait: bool,
    },

    Kill { id: String },

    /// Run the install steps in the background
    Install { id: String },

    Stats { id: String },

    Status { id: String },

    /// Console output newer than `since` (unix millis, 0 for everything)
    Console {
        id: String,
        #[serde(default)]
        since: i64,
    },

    /// Write a line to the server's console input
    SendCommand { id: String, command: String },

    GetData { id: String },

    EditData {
        id: String,
        data: HashMap<String, Value>,
        #[serde(default)]
        as_admin: bool,
    },

    /// Start a backup in the background
    Backup { id: String },

    ListBackups { id: String },

    Restore { id: String, file: String },

    ListTasks { id: String },

    AddTask { id: String, name: String, task: Task },

    RemoveTask { id: String, name: String },

    RunTask { id: String, name: String },

    /// Stop every server and the daemon
    Shutdown,
}

impl Request {
    /// Server the request targets, if any
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Request::Ping | Request::List | Request::Shutdown => None,
            Request::Create { definition, .. } => Some(&definition.id),
            Request::Delete { id }
            | Request::Start { id }
            | Request::Stop { id, .. }
            | Request::Kill { id }
            | Request::Install { id }
            | Request::Stats { id }
            | Request::Status { id }
            | Request::Console { id, .. }
            | Request::SendCommand { id, .. }
            | Request::GetData { id }
            | Request::EditData { id, .. }
            | Request::Backup { id }
            | Request::ListBackups { id }
            | Request::Restore { id, .. }
            | Request::ListTasks { id }
            | Request::AddTask { id, .. }
            | Request::RemoveTask { id, .. }
            | Request::RunTask { id, .. } => Some(id),
        }
    }
}

/// IPC Response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Ping response
    Pong,

    /// Success with message
    Ok { message: String },

    /// Error with message
    Error { message: String },

    Servers { servers: Vec<ServerInfo> },

    Stats { stats: ServerStats },

    Status { status: ServerStatus },

    /// Console text plus the epoch to pass as `since` next time
    Console { logs: String, epoch: i64 },

    Data { data: HashMap<String, Variable> },

    /// Name of the backup archive being written
    Backup { file: String },

    Backups { backups: Vec<FileDesc> },

    Tasks { tasks: BTreeMap<String, Task> },
}

impl Response {
    pub fn ok<S: Into<String>>(message: S) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Error { message } => Some(message),
            _ => None,
        }
    }
}
