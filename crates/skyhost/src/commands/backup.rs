//! Backup commands

use anyhow::Result;
use skyhost_ipc::{IpcClient, Request, Response};

use crate::output::{print_backups, print_success};

pub async fn create(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::Backup { id: id.to_string() }).await? {
        Response::Backup { file } => {
            print_success(&format!("Backup {} written for {}", file, id));
            Ok(())
        }
        _ => super::unexpected(),
    }
}

pub async fn list(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::ListBackups { id: id.to_string() }).await? {
        Response::Backups { backups } => {
            print_backups(&backups);
            Ok(())
        }
        _ => super::unexpected(),
    }
}

pub async fn restore(client: &IpcClient, id: &str, file: &str) -> Result<()> {
    super::confirm(
        client,
        Request::Restore {
            id: id.to_string(),
            file: file.to_string(),
        },
    )
    .await
}
