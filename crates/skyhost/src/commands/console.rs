//! Console output and input

use anyhow::Result;
use skyhost_ipc::{IpcClient, Request, Response};
use std::io::Write;
use std::time::Duration;

use crate::cli::ConsoleArgs;
use crate::output::is_json_mode;

pub async fn execute(client: &IpcClient, args: ConsoleArgs) -> Result<()> {
    let mut since = 0;
    loop {
        let request = Request::Console {
            id: args.id.clone(),
            since,
        };
        let (logs, epoch) = match super::request(client, request).await? {
            Response::Console { logs, epoch } => (logs, epoch),
            _ => return super::unexpected(),
        };
        since = epoch;

        if is_json_mode() {
            println!("{}", serde_json::json!({"logs": logs, "epoch": epoch}));
        } else if !logs.is_empty() {
            print!("{}", logs);
            std::io::stdout().flush()?;
        }

        if !args.follow {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(args.interval)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

pub async fn send(client: &IpcClient, id: &str, command: &str) -> Result<()> {
    super::confirm(
        client,
        Request::SendCommand {
            id: id.to_string(),
            command: command.to_string(),
        },
    )
    .await
}
