//! IPC Client - Unix socket client for the CLI

use skyhost_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::protocol::{Request, Response};

/// Name of the daemon binary, looked up next to the CLI first
const DAEMON_BINARY: &str = "skyhostd";

pub struct IpcClient {
    socket_path: PathBuf,
    config_path: Option<PathBuf>,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            config_path: None,
        }
    }

    /// Config file handed to a daemon this client starts
    pub fn with_config(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }

    /// Connect to a running daemon
    pub async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(Error::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    Error::DaemonNotRunning
                }
                _ => Error::IpcConnectionFailed(e.to_string()),
            })
    }

    /// Connect, starting the daemon first when none answers
    pub async fn connect_or_start(&self) -> Result<UnixStream> {
        match self.connect().await {
            Ok(stream) => Ok(stream),
            Err(Error::DaemonNotRunning) => {
                info!("daemon not running, starting it");
                self.start_daemon()?;

                for i in 0..50 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Ok(stream) = self.connect().await {
                        debug!(after_ms = (i + 1) * 100, "connected to daemon");
                        return Ok(stream);
                    }
                }

                Err(Error::Timeout("daemon failed to start within 5s".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn start_daemon(&self) -> Result<()> {
        let exe = std::env::current_exe()?;
        let beside = exe.parent().map(|dir| dir.join(DAEMON_BINARY));
        let daemon_exe = match beside {
            Some(path) if path.exists() => path,
            _ => {
                warn!("{} not found next to the CLI, trying PATH", DAEMON_BINARY);
                PathBuf::from(DAEMON_BINARY)
            }
        };

        let mut command = Command::new(&daemon_exe);
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::ipc(format!("Failed to start daemon: {}", e)))?;

        info!(daemon = %daemon_exe.display(), "daemon started");
        Ok(())
    }

    /// Send one request and read its response
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let stream = match request {
            Request::Ping | Request::Shutdown => self.connect().await?,
            _ => self.connect_or_start().await?,
        };
        let (read, mut write) = stream.into_split();

        let mut json = serde_json::to_string(request)?;
        json.push('\n');
        write
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::ipc(format!("Write error: {}", e)))?;
        write
            .flush()
            .await
            .map_err(|e| Error::ipc(format!("Flush error: {}", e)))?;
        debug!(?request, "sent request");

        let mut reader = BufReader::new(read);
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::ipc(format!("Read error: {}", e)))?;
        if read == 0 {
            return Err(Error::ipc("daemon closed the connection"));
        }

        let response: Response = serde_json::from_str(line.trim())
            .map_err(|e| Error::ipc(format!("Invalid response: {}", e)))?;
        debug!(?response, "received response");
        Ok(response)
    }

    /// True when a daemon answers
    pub async fn ping(&self) -> Result<bool> {
        match self.send(&Request::Ping).await {
            Ok(Response::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(Error::DaemonNotRunning) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
