//! The server service: every loaded server plus the background tickers
//!
//! One instance per daemon. `init` loads the definitions from disk and
//! starts two tickers: the start queue drain (one queued start per
//! interval) and the stats sweep (publish stats of running servers and
//! feed the alert tracker). `shutdown` stops both and brings every
//! running server down within the configured stop timeout.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skyhost_core::{DaemonConfig, Error, Result, ServerDefinition, ServerInfo};
use skyhost_env::ContainerRuntime;
use skyhost_ops::OperationRegistry;

use crate::alerts::{Alert, AlertTracker};
use crate::queue::StartQueue;
use crate::registry::ServerRegistry;
use crate::server::{Server, ServerContext};

pub struct ServerService {
    config: Arc<DaemonConfig>,
    operations: Arc<OperationRegistry>,
    servers: Arc<ServerRegistry>,
    queue: Arc<StartQueue>,
    alerts: Arc<AlertTracker>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    shutdown_tx: broadcast::Sender<()>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerService {
    /// Service with the built-in operation types. Container servers use
    /// `runtime`, or connect to the local Docker engine when it is `None`.
    pub fn new(config: DaemonConfig, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        let operations = OperationRegistry::with_defaults(reqwest::Client::new(), &config.binaries_dir);
        Self::with_operations(config, operations, runtime)
    }

    pub fn with_operations(
        config: DaemonConfig,
        operations: OperationRegistry,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let alerts = AlertTracker::new(&config.service, system.total_memory());
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config: Arc::new(config),
            operations: Arc::new(operations),
            servers: Arc::new(ServerRegistry::new()),
            queue: Arc::new(StartQueue::new()),
            alerts: Arc::new(alerts),
            runtime,
            shutdown_tx,
            tickers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn queue(&self) -> &StartQueue {
        &self.queue
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    fn context(&self) -> ServerContext {
        ServerContext {
            config: self.config.clone(),
            operations: self.operations.clone(),
            queue: self.queue.clone(),
            servers: Arc::downgrade(&self.servers),
        }
    }

    /// Load every server from disk and start the tickers. Returns the
    /// number of servers loaded.
    pub async fn init(&self) -> Result<usize> {
        self.config.ensure_dirs()?;
        let loaded = self.load_servers().await?;
        info!(servers = loaded, queued = self.queue.len(), "server service initialised");

        self.spawn_start_queue();
        self.spawn_stats_sweep();
        Ok(loaded)
    }

    /// Load every `<id>.json` under the servers dir. Broken definitions are
    /// logged and skipped.
    pub async fn load_servers(&self) -> Result<usize> {
        let mut dir = tokio::fs::read_dir(&self.config.servers_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load_server(&path).await {
                Ok(server) => {
                    debug!(server = %server.id(), "server loaded");
                    loaded += 1;
                }
                Err(e) => error!(path = %path.display(), error = %e, "failed to load server"),
            }
        }
        Ok(loaded)
    }

    async fn load_server(&self, path: &Path) -> Result<Arc<Server>> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut definition: ServerDefinition = serde_json::from_str(&content)?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if definition.id.is_empty() {
            definition.id = stem;
        } else if definition.id != stem {
            return Err(Error::InvalidServer(format!(
                "definition id '{}' does not match file name '{}'",
                definition.id, stem
            )));
        }

        let server = Arc::new(Server::build(definition, self.context(), self.runtime.clone())?);
        let scheduler = server.scheduler();
        if let Err(e) = async {
            scheduler.load().await?;
            scheduler.start()
        }
        .await
        {
            warn!(server = %server.id(), error = %e, "failed to load schedule");
        }

        self.servers.insert(server.clone());
        if server.is_auto_start() {
            self.queue.push(server.id());
        }
        Ok(server)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Server>> {
        self.servers
            .get(id)
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.all()
    }

    pub async fn list(&self) -> Vec<ServerInfo> {
        let mut infos = Vec::new();
        for server in self.servers.all() {
            infos.push(server.info().await);
        }
        infos
    }

    /// Register a new server: build its Environment, create the root and
    /// persist the definition. Installation is a separate step.
    pub async fn create_server(&self, definition: ServerDefinition) -> Result<Arc<Server>> {
        definition.validate()?;
        if self.servers.contains(&definition.id) || self.config.server_file(&definition.id).exists() {
            return Err(Error::ServerExists(definition.id));
        }

        let server = Arc::new(Server::build(definition, self.context(), self.runtime.clone())?);
        server.environment().create().await?;
        server.save().await?;
        server.scheduler().start()?;

        info!(server = %server.id(), "server created");
        self.servers.insert(server.clone());
        Ok(server)
    }

    /// Run the uninstall steps and remove every trace of the server
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let server = self.get(id)?;
        server.destroy().await?;
        self.servers.remove(id);
        self.alerts.forget(id);
        info!(server = %id, "server deleted");
        Ok(())
    }

    /// Start the next queued server, if any
    pub async fn start_next(&self) -> Option<Result<()>> {
        start_next(&self.queue, &self.servers).await
    }

    /// Publish stats of every running server and feed the alert tracker
    pub async fn sweep_stats(&self) -> Vec<Alert> {
        sweep_stats(&self.servers, &self.alerts).await
    }

    fn spawn_start_queue(&self) {
        let queue = self.queue.clone();
        let servers = self.servers.clone();
        let period = self.config.service.start_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        start_next(&queue, &servers).await;
                    }
                }
            }
        });
        self.tickers.lock().push(handle);
    }

    fn spawn_stats_sweep(&self) {
        let servers = self.servers.clone();
        let alerts = self.alerts.clone();
        let period = self.config.service.stats_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        sweep_stats(&servers, &alerts).await;
                    }
                }
            }
        });
        self.tickers.lock().push(handle);
    }

    /// Stop the tickers and schedulers, then stop every running server,
    /// killing those that outlive the stop timeout
    pub async fn shutdown(&self) {
        info!("shutting down server service");
        self.queue.close();
        let _ = self.shutdown_tx.send(());
        for handle in self.tickers.lock().drain(..) {
            handle.abort();
        }

        let timeout = self.config.service.stop_timeout();
        let mut stopping = Vec::new();
        for server in self.servers.all() {
            server.scheduler().stop();
            if !server.is_running().await {
                continue;
            }
            stopping.push(tokio::spawn(async move {
                if let Err(e) = server.stop().await {
                    warn!(server = %server.id(), error = %e, "stop failed, killing");
                }
                if let Err(e) = server.environment().wait_for_main_process_for(timeout).await {
                    error!(server = %server.id(), error = %e, "server did not stop");
                }
            }));
        }
        for handle in stopping {
            let _ = handle.await;
        }
        info!("server service stopped");
    }
}

async fn start_next(queue: &StartQueue, servers: &ServerRegistry) -> Option<Result<()>> {
    let id = queue.pop()?;
    let Some(server) = servers.get(&id) else {
        debug!(server = %id, "queued server no longer exists");
        return Some(Err(Error::ServerNotFound(id)));
    };
    let result = server.start().await;
    if let Err(e) = &result {
        warn!(server = %id, error = %e, "queued start failed");
    }
    Some(result)
}

async fn sweep_stats(servers: &ServerRegistry, alerts: &AlertTracker) -> Vec<Alert> {
    let mut raised = Vec::new();
    for server in servers.all() {
        let running = server.is_running().await;
        let stats = if running {
            match server.stats().await {
                Ok(stats) => {
                    server.environment().publish_stats(stats.clone());
                    Some(stats)
                }
                Err(e) => {
                    debug!(server = %server.id(), error = %e, "stats unavailable");
                    None
                }
            }
        } else {
            None
        };
        raised.extend(alerts.observe(server.id(), running, stats.as_ref()));
    }
    raised
}
