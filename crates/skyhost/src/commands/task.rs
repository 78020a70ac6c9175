//! Scheduled task commands

use anyhow::Result;
use skyhost_core::Task;
use skyhost_ipc::{IpcClient, Request, Response};
use std::path::Path;

use crate::output::print_tasks;

pub async fn list(client: &IpcClient, id: &str) -> Result<()> {
    match super::request(client, Request::ListTasks { id: id.to_string() }).await? {
        Response::Tasks { tasks } => {
            print_tasks(&tasks);
            Ok(())
        }
        _ => super::unexpected(),
    }
}

pub async fn add(client: &IpcClient, id: &str, name: &str, file: &Path) -> Result<()> {
    let task: Task = super::read_json(file)?;
    super::confirm(
        client,
        Request::AddTask {
            id: id.to_string(),
            name: name.to_string(),
            task,
        },
    )
    .await
}

pub async fn remove(client: &IpcClient, id: &str, name: &str) -> Result<()> {
    super::confirm(
        client,
        Request::RemoveTask {
            id: id.to_string(),
            name: name.to_string(),
        },
    )
    .await
}

pub async fn run(client: &IpcClient, id: &str, name: &str) -> Result<()> {
    super::confirm(
        client,
        Request::RunTask {
            id: id.to_string(),
            name: name.to_string(),
        },
    )
    .await
}
