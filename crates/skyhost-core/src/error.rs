//! Error types for skyhost

use std::path::PathBuf;

/// skyhost error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Process already running")]
    ProcessRunning,

    #[error("Server is offline")]
    ServerOffline,

    #[error("Server is running")]
    ServerRunning,

    #[error("Backup or restore in progress")]
    BackupInProgress,

    #[error("Image is currently downloading")]
    ImageDownloading,

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Environment does not support this operation: {0}")]
    EnvironmentNotSupported(String),

    #[error("Path resolves outside of the server root: {0}")]
    PathOutsideRoot(String),

    #[error("No factory registered for operation type: {0}")]
    MissingFactory(String),

    #[error("Failed to create operation {op}: {message}")]
    FactoryError { op: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Command exited with code {0}")]
    CommandFailed(i32),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server already exists: {0}")]
    ServerExists(String),

    #[error("Invalid server definition: {0}")]
    InvalidServer(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    #[error("Process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("IPC connection failed: {0}")]
    IpcConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

/// Result type alias for skyhost
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::ConfigError(msg.into())
    }

    pub fn ipc<S: Into<String>>(msg: S) -> Self {
        Error::IpcError(msg.into())
    }

    pub fn docker<S: Into<String>>(msg: S) -> Self {
        Error::Docker(msg.into())
    }

    pub fn process_start<S: Into<String>>(msg: S) -> Self {
        Error::ProcessStartFailed(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn factory<O: Into<String>, S: ToString>(op: O, err: S) -> Self {
        Error::FactoryError {
            op: op.into(),
            message: err.to_string(),
        }
    }

    /// True for errors caused by a server being in the wrong state for the request
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Error::ProcessRunning
                | Error::ServerOffline
                | Error::ServerRunning
                | Error::BackupInProgress
                | Error::ImageDownloading
                | Error::ContainerExists(_)
        )
    }

    /// True when the underlying IO error is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::IoError(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
