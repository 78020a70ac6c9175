//! Shutdown command implementation

use anyhow::{bail, Result};
use skyhost_core::Error;
use skyhost_ipc::{IpcClient, Request, Response};

use crate::output::{print_error, print_success};

pub async fn execute(client: &IpcClient) -> Result<()> {
    match client.send(&Request::Shutdown).await {
        Ok(Response::Ok { message }) => {
            print_success(&message);
            Ok(())
        }
        Ok(Response::Error { message }) => {
            print_error(&message);
            bail!(message)
        }
        Ok(_) => super::unexpected(),
        Err(Error::DaemonNotRunning) => {
            print_success("Daemon is not running");
            Ok(())
        }
        Err(e) => {
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}
