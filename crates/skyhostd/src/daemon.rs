//! Main daemon orchestration

use skyhost_core::{DaemonConfig, Result};
use skyhost_env::{BollardRuntime, ContainerRuntime};
use skyhost_ipc::{IpcConnection, IpcServer, Request, Response};
use skyhost_servers::ServerService;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::handlers::RequestHandler;

pub struct Daemon {
    server: IpcServer,
    service: Arc<ServerService>,
    handler: Arc<RequestHandler>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Load every server, start the service tickers and bind the socket
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let runtime: Option<Arc<dyn ContainerRuntime>> = match BollardRuntime::connect() {
            Ok(runtime) => Some(Arc::new(runtime)),
            Err(e) => {
                warn!(error = %e, "docker unavailable, container servers will fail to load");
                None
            }
        };

        let socket_path = config.socket_path.clone();
        let service = Arc::new(ServerService::new(config, runtime));
        let loaded = service.init().await?;
        info!(servers = loaded, "servers loaded");

        let shutdown = Arc::new(Notify::new());
        let handler = Arc::new(RequestHandler::new(service.clone(), shutdown.clone()));
        let server = IpcServer::bind(&socket_path).await?;

        Ok(Self {
            server,
            service,
            handler,
            shutdown,
        })
    }

    /// Serve connections until a shutdown request arrives
    pub async fn run(&self) -> Result<()> {
        info!("daemon running, waiting for connections");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("shutdown requested over IPC");
                    return Ok(());
                }
                accepted = self.server.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(serve(conn, handler));
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }
}

async fn serve(mut conn: IpcConnection, handler: Arc<RequestHandler>) {
    loop {
        let request = match conn.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                // Tell the client before dropping it
                let _ = conn.send_response(&Response::error(e.to_string())).await;
                break;
            }
        };

        let shutting_down = matches!(request, Request::Shutdown);
        let response = handler.handle(request).await;
        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "client went away");
            break;
        }
        if shutting_down {
            break;
        }
    }
}
