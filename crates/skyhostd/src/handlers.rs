//! IPC request handlers

use serde_json::Value;
use skyhost_core::{Error, Result, ServerDefinition, Task};
use skyhost_ipc::{Request, Response};
use skyhost_servers::{Server, ServerService};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

/// Maps requests onto the server service
pub struct RequestHandler {
    service: Arc<ServerService>,
    shutdown: Arc<Notify>,
}

/// Turn a result into a response, logging failures
fn respond<T>(action: &str, result: Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            error!(action, error = %e, "request failed");
            Response::error(e.to_string())
        }
    }
}

impl RequestHandler {
    pub fn new(service: Arc<ServerService>, shutdown: Arc<Notify>) -> Self {
        Self { service, shutdown }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::List => Response::Servers {
                servers: self.service.list().await,
            },
            Request::Create {
                definition,
                install,
            } => self.create(definition, install).await,
            Request::Delete { id } => respond("delete", self.service.delete_server(&id).await, |_| {
                Response::ok(format!("Server {} deleted", id))
            }),
            Request::Start { id } => self.start(&id).await,
            Request::Stop { id, wait } => self.stop(&id, wait).await,
            Request::Kill { id } => self.kill(&id).await,
            Request::Install { id } => self.install(&id).await,
            Request::Stats { id } => self.stats(&id).await,
            Request::Status { id } => respond("status", self.service.get(&id), |server| {
                Response::Status {
                    status: server.environment().status(),
                }
            }),
            Request::Console { id, since } => respond("console", self.service.get(&id), |server| {
                let (logs, epoch) = server.environment().console_buffer().read_since(since);
                Response::Console { logs, epoch }
            }),
            Request::SendCommand { id, command } => self.send_command(&id, &command).await,
            Request::GetData { id } => respond("get_data", self.service.get(&id), |server| {
                Response::Data {
                    data: server.get_data(),
                }
            }),
            Request::EditData { id, data, as_admin } => self.edit_data(&id, data, as_admin).await,
            Request::Backup { id } => self.backup(&id).await,
            Request::ListBackups { id } => self.list_backups(&id).await,
            Request::Restore { id, file } => self.restore(&id, &file).await,
            Request::ListTasks { id } => respond("list_tasks", self.service.get(&id), |server| {
                Response::Tasks {
                    tasks: server.scheduler().tasks(),
                }
            }),
            Request::AddTask { id, name, task } => self.add_task(&id, &name, task).await,
            Request::RemoveTask { id, name } => self.remove_task(&id, &name).await,
            Request::RunTask { id, name } => self.run_task(&id, &name),
            Request::Shutdown => {
                info!("shutdown requested");
                self.shutdown.notify_one();
                Response::ok("Daemon shutting down")
            }
        }
    }

    async fn create(&self, definition: ServerDefinition, install: bool) -> Response {
        let id = definition.id.clone();
        info!(server = %id, install, "handling create request");

        let result = async {
            let server = self.service.create_server(definition).await?;
            if install {
                server.start_install().await?;
            }
            Ok::<_, Error>(server)
        }
        .await;
        respond("create", result, |_| Response::ok(format!("Server {} created", id)))
    }

    async fn start(&self, id: &str) -> Response {
        let result = async { self.server(id)?.start().await }.await;
        respond("start", result, |_| Response::ok(format!("Server {} started", id)))
    }

    async fn stop(&self, id: &str, wait: bool) -> Response {
        let result = async {
            let server = self.server(id)?;
            server.stop().await?;
            if wait {
                let timeout = self.service.config().service.stop_timeout();
                server.environment().wait_for_main_process_for(timeout).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        respond("stop", result, |_| {
            if wait {
                Response::ok(format!("Server {} stopped", id))
            } else {
                Response::ok(format!("Server {} told to stop", id))
            }
        })
    }

    async fn kill(&self, id: &str) -> Response {
        let result = async { self.server(id)?.kill().await }.await;
        respond("kill", result, |_| Response::ok(format!("Server {} killed", id)))
    }

    async fn install(&self, id: &str) -> Response {
        let result = async { self.server(id)?.start_install().await }.await;
        respond("install", result, |_| {
            Response::ok(format!("Installing server {}", id))
        })
    }

    async fn stats(&self, id: &str) -> Response {
        let result = async { self.server(id)?.stats().await }.await;
        respond("stats", result, |stats| Response::Stats { stats })
    }

    async fn send_command(&self, id: &str, command: &str) -> Response {
        let result = async { self.server(id)?.execute(command).await }.await;
        respond("send_command", result, |_| Response::ok("Command sent"))
    }

    async fn edit_data(&self, id: &str, data: HashMap<String, Value>, as_admin: bool) -> Response {
        let result = async { self.server(id)?.edit_data(data, as_admin).await }.await;
        respond("edit_data", result, |_| Response::ok("Data updated"))
    }

    async fn backup(&self, id: &str) -> Response {
        let result = async { self.server(id)?.start_backup().await }.await;
        respond("backup", result, |file| Response::Backup { file })
    }

    async fn list_backups(&self, id: &str) -> Response {
        let result = async { self.server(id)?.list_backups().await }.await;
        respond("list_backups", result, |backups| Response::Backups { backups })
    }

    async fn restore(&self, id: &str, file: &str) -> Response {
        let result = async { self.server(id)?.start_restore(file).await }.await;
        respond("restore", result, |_| {
            Response::ok(format!("Restoring {} from {}", id, file))
        })
    }

    async fn add_task(&self, id: &str, name: &str, task: Task) -> Response {
        let result = async { self.server(id)?.scheduler().add_task(name, task).await }.await;
        respond("add_task", result, |_| Response::ok(format!("Task {} saved", name)))
    }

    async fn remove_task(&self, id: &str, name: &str) -> Response {
        let result = async { self.server(id)?.scheduler().remove_task(name).await }.await;
        respond("remove_task", result, |_| {
            Response::ok(format!("Task {} removed", name))
        })
    }

    fn run_task(&self, id: &str, name: &str) -> Response {
        let result = self.server(id).and_then(|server| server.scheduler().run_task(name));
        respond("run_task", result, |_| Response::ok(format!("Task {} started", name)))
    }

    fn server(&self, id: &str) -> Result<Arc<Server>> {
        self.service.get(id)
    }
}
