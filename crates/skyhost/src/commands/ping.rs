//! Ping command implementation

use anyhow::{bail, Result};
use skyhost_ipc::{IpcClient, Request, Response};

use crate::output::{print_error, print_success};

pub async fn execute(client: &IpcClient) -> Result<()> {
    match client.send(&Request::Ping).await {
        Ok(Response::Pong) => {
            print_success("Daemon is alive");
            Ok(())
        }
        Ok(Response::Error { message }) => {
            print_error(&message);
            bail!(message)
        }
        Ok(_) => super::unexpected(),
        Err(e) => {
            print_error(&format!("Daemon is not running: {}", e));
            bail!("Daemon not running")
        }
    }
}
