//! List command implementation

use anyhow::Result;
use skyhost_ipc::{IpcClient, Request, Response};

use crate::output::print_servers;

pub async fn execute(client: &IpcClient) -> Result<()> {
    match super::request(client, Request::List).await? {
        Response::Servers { servers } => {
            print_servers(&servers);
            Ok(())
        }
        _ => super::unexpected(),
    }
}
