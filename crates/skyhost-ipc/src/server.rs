//! IPC Server - Unix socket listener of the daemon

use skyhost_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// Upper bound of a single request line
const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;

use crate::protocol::{Request, Response};

pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    /// Bind to a Unix socket, replacing a stale socket file
    pub async fn bind(socket_path: &Path) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| Error::ipc(format!("Failed to bind socket: {}", e)))?;

        // Owner only
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::ipc(format!("Failed to set socket permissions: {}", e)))?;
        }

        info!(socket = %socket_path.display(), "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
        })
    }

    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::ipc(format!("Accept failed: {}", e)))?;

        debug!("accepted IPC connection");
        Ok(IpcConnection::new(stream))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                error!(error = %e, "failed to remove socket file");
            }
        }
    }
}

/// Single client connection
pub struct IpcConnection {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    max_message_size: u64,
}

impl IpcConnection {
    pub fn new(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Cap on the size of each request line
    pub fn with_max_message_size(mut self, limit: u64) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Next request, or `None` once the client hung up
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let mut line = String::new();
        let limit = self.max_message_size;
        match (&mut self.reader).take(limit).read_line(&mut line).await {
            Ok(0) => Ok(None),
            Ok(n) if n as u64 >= limit && !line.ends_with('\n') => Err(Error::ipc(format!(
                "Request exceeds {} bytes",
                limit
            ))),
            Ok(_) => {
                let request: Request = serde_json::from_str(line.trim())
                    .map_err(|e| Error::ipc(format!("Invalid request: {}", e)))?;
                debug!(?request, "received request");
                Ok(Some(request))
            }
            Err(e) => Err(Error::ipc(format!("Read error: {}", e))),
        }
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::ipc(format!("Write error: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::ipc(format!("Flush error: {}", e)))?;

        debug!(?response, "sent response");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IpcClient;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_server_bind() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_response_over_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let accept = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            while let Some(request) = conn.read_request().await.unwrap() {
                let response = match request {
                    Request::Ping => Response::Pong,
                    Request::Start { id } => Response::ok(format!("started {}", id)),
                    _ => Response::error("unsupported"),
                };
                conn.send_response(&response).await.unwrap();
            }
        });

        let client = IpcClient::new(socket_path);
        assert!(client.ping().await.unwrap());
        drop(accept);
    }

    #[tokio::test]
    async fn test_several_requests_on_one_connection() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            while let Ok(Some(request)) = conn.read_request().await {
                let response = match request {
                    Request::Start { id } => Response::ok(format!("started {}", id)),
                    _ => Response::error("unsupported"),
                };
                if conn.send_response(&response).await.is_err() {
                    break;
                }
            }
        });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        for id in ["a", "b"] {
            let json = serde_json::to_string(&Request::Start { id: id.into() }).unwrap();
            write.write_all(format!("{}\n", json).as_bytes()).await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            let response: Response = serde_json::from_str(&line).unwrap();
            assert_eq!(response, Response::ok(format!("started {}", id)));
        }
    }

    #[tokio::test]
    async fn test_size_limit_applies_per_request() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let handler = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap().with_max_message_size(64);
            loop {
                match conn.read_request().await {
                    Ok(Some(Request::Start { id })) => {
                        conn.send_response(&Response::ok(format!("started {}", id))).await.unwrap();
                    }
                    Ok(Some(_)) => conn.send_response(&Response::error("unsupported")).await.unwrap(),
                    Ok(None) => return None,
                    Err(e) => return Some(e),
                }
            }
        });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Together well past the cap, each one under it
        for n in 0..10 {
            let id = format!("server-{}", n);
            let json = serde_json::to_string(&Request::Start { id: id.clone() }).unwrap();
            assert!(json.len() < 64);
            write.write_all(format!("{}\n", json).as_bytes()).await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            let response: Response = serde_json::from_str(&line).unwrap();
            assert_eq!(response, Response::ok(format!("started {}", id)));
        }

        let oversized = serde_json::to_string(&Request::Start { id: "x".repeat(100) }).unwrap();
        write.write_all(format!("{}\n", oversized).as_bytes()).await.unwrap();
        let error = handler.await.unwrap().unwrap();
        assert!(error.to_string().contains("exceeds 64 bytes"));
    }
}
