//! Start, stop and inspect running servers

use anyhow::Result;
use skyhost_ipc::{IpcClient, Request, Response};

use crate::output::{print_stats, print_status};

pub async fn start(client: &IpcClient, id: &str) -> Result<()> {
    super::confirm(client, Request::Start { id: id.to_string() }).await
}

pub async fn stop(client: &IpcClient, id: &str, wait: bool) -> Result<()> {
    super::confirm(
        client,
        Request::Stop {
            id: id.to_string(),
            wait,
        },
    )
    .await
}

pub async fn kill(client: &IpcClient, id: &str) -> Result<()> {
    super::confirm(client, Request::Kill { id: id.to_string() }).await
}

pub async fn stats(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::Stats { id: id.to_string() }).await? {
        Response::Stats { stats } => {
            print_stats(id, &stats);
            Ok(())
        }
        _ => super::unexpected(),
    }
}

pub async fn status(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::Status { id: id.to_string() }).await? {
        Response::Status { status } => {
            print_status(id, &status);
            Ok(())
        }
        _ => super::unexpected(),
    }
}
