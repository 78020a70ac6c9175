//! Command implementations

pub mod backup;
pub mod console;
pub mod data;
pub mod list;
pub mod ping;
pub mod power;
pub mod server;
pub mod shutdown;
pub mod task;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use skyhost_core::DaemonConfig;
use skyhost_ipc::{IpcClient, Request, Response};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::output::{print_error, print_success};

/// Build the IPC client from the daemon config and the socket override
pub fn get_client(config: Option<PathBuf>, socket: Option<PathBuf>) -> Result<IpcClient> {
    let (daemon_config, found) = DaemonConfig::discover(config.as_deref())?;
    let socket = socket.unwrap_or(daemon_config.socket_path);
    debug!(socket = %socket.display(), config = ?found, "using daemon socket");
    Ok(IpcClient::new(socket).with_config(found))
}

/// Send a request, turning daemon errors into command failures
pub async fn request(client: &IpcClient, request: Request) -> Result<Response> {
    match client.send(&request).await {
        Ok(Response::Error { message }) => {
            print_error(&message);
            bail!(message)
        }
        Ok(response) => Ok(response),
        Err(e) => {
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}

/// Send a request answered with a plain confirmation
pub async fn confirm(client: &IpcClient, req: Request) -> Result<()> {
    match request(client, req).await? {
        Response::Ok { message } => {
            print_success(&message);
            Ok(())
        }
        _ => unexpected(),
    }
}

pub fn unexpected<T>() -> Result<T> {
    print_error("Unexpected response from daemon");
    bail!("Unexpected response")
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyhost_core::ServerDefinition;
    use tempfile::TempDir;

    #[test]
    fn test_socket_override_wins() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("custom.sock");
        let client = get_client(None, Some(socket.clone())).unwrap();
        assert_eq!(client.socket_path(), socket.as_path());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let tmp = TempDir::new().unwrap();
        assert!(get_client(Some(tmp.path().join("missing.toml")), None).is_err());
    }

    #[test]
    fn test_read_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lobby.json");
        std::fs::write(&path, r#"{"id": "lobby", "display": "Lobby"}"#).unwrap();

        let def: ServerDefinition = read_json(&path).unwrap();
        assert_eq!(def.id, "lobby");

        std::fs::write(&path, "{").unwrap();
        let err = read_json::<ServerDefinition>(&path).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }
}
