//! A hosted server: its definition, its Environment and its lifecycle

mod busy;
mod files;

pub use busy::Activity;
pub use files::Item;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use skyhost_conditions::{resolve_if, VARIABLE_ENV, VARIABLE_SERVER_ID};
use skyhost_core::{
    replace_tokens, replace_tokens_in_map, split_arguments, Bindings, DaemonConfig, Error, KeepAlive,
    OperationSpec, Result, ServerDefinition, ServerInfo, ServerStats, Variable,
};
use skyhost_env::{ContainerRuntime, Environment, ExecutionData};
use skyhost_ops::{OperationProcess, OperationRegistry, PipelineReport, VARIABLE_ROOT_DIR};

use crate::queue::StartQueue;
use crate::registry::ServerRegistry;
use crate::scheduler::Scheduler;

use self::busy::{BusyGuard, BusySlot};

/// Shared handles every server needs
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<DaemonConfig>,
    pub operations: Arc<OperationRegistry>,
    pub queue: Arc<StartQueue>,
    pub servers: Weak<ServerRegistry>,
}

pub struct Server {
    id: String,
    definition: RwLock<ServerDefinition>,
    env: Environment,
    scheduler: Scheduler,
    ctx: ServerContext,
    crashes: AtomicU32,
    busy: Arc<BusySlot>,
    keepalive: Mutex<Option<oneshot::Sender<()>>>,
}

impl Server {
    /// Validate the definition and build the Environment it names
    pub fn build(
        definition: ServerDefinition,
        ctx: ServerContext,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Result<Self> {
        definition.validate()?;
        let env = Environment::new(&definition.id, &definition.environment, &ctx.config, runtime)?;
        Ok(Self::new(definition, env, ctx))
    }

    pub fn new(definition: ServerDefinition, env: Environment, ctx: ServerContext) -> Self {
        let id = definition.id.clone();
        let scheduler = Scheduler::new(&id, ctx.config.schedule_file(&id), ctx.servers.clone());
        Self {
            id,
            definition: RwLock::new(definition),
            env,
            scheduler,
            ctx,
            crashes: AtomicU32::new(0),
            busy: BusySlot::new(),
            keepalive: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> ServerDefinition {
        self.definition.read().clone()
    }

    pub fn display_name(&self) -> String {
        self.definition.read().display_name().to_string()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn crash_count(&self) -> u32 {
        self.crashes.load(Ordering::SeqCst)
    }

    pub fn is_auto_start(&self) -> bool {
        self.definition.read().execution.auto_start
    }

    pub async fn is_running(&self) -> bool {
        self.env.is_running().await
    }

    pub async fn info(&self) -> ServerInfo {
        let (display, environment) = {
            let def = self.definition.read();
            (def.display_name().to_string(), def.environment.kind.clone())
        };
        ServerInfo {
            id: self.id.clone(),
            display,
            environment,
            running: self.is_running().await,
            installing: self.env.is_installing(),
        }
    }

    /// Variables plus `rootDir`, `core:os` and `core:arch`
    pub fn data_to_map(&self) -> Bindings {
        let mut map = self.definition.read().variable_values();
        map.insert(
            VARIABLE_ROOT_DIR.to_string(),
            Value::String(self.env.root().display().to_string()),
        );
        map.insert("core:os".to_string(), Value::String(std::env::consts::OS.to_string()));
        map.insert("core:arch".to_string(), Value::String(std::env::consts::ARCH.to_string()));
        map
    }

    /// Evaluate a condition against this server's variables
    pub fn run_condition(&self, condition: &str, extra: &Bindings) -> Result<bool> {
        let mut bindings = self.data_to_map();
        bindings.insert(VARIABLE_ENV.to_string(), Value::String(self.env.kind().to_string()));
        bindings.insert(VARIABLE_SERVER_ID.to_string(), Value::String(self.id.clone()));
        bindings.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        resolve_if(condition, &bindings, &self.env.functions())
            .map_err(|e| Error::Condition(e.to_string()))
    }

    /// Run operations against this server with its current variables
    pub async fn run_pipeline(&self, operations: &[OperationSpec], extra: Bindings) -> Result<PipelineReport> {
        let environment = self.definition.read().execution.environment_vars.clone();
        let process = OperationProcess::generate(operations, &environment, &self.ctx.operations)?;
        let mut bindings = self.data_to_map();
        bindings.extend(extra);
        process.run(&self.env, &self.ctx.operations, bindings).await
    }

    /// Fails while a backup or restore runs, or while the server runs,
    /// installs, starts or is being destroyed
    pub async fn is_idle(&self) -> Result<()> {
        if let Some(activity) = self.busy.current() {
            return Err(activity.conflict());
        }
        if self.env.is_installing() || self.env.is_running().await {
            return Err(Error::ServerRunning);
        }
        Ok(())
    }

    pub fn activity(&self) -> Option<Activity> {
        self.busy.current()
    }

    /// Take the activity slot; the process must not be running
    async fn claim(&self, activity: Activity) -> Result<BusyGuard> {
        let guard = self.busy.claim(activity)?;
        if self.env.is_installing() || self.env.is_running().await {
            return Err(Error::ServerRunning);
        }
        Ok(guard)
    }

    /// Run the pre-execution steps and start the server process
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _starting = self.claim(Activity::Starting).await?;

        info!(server = %self.id, "starting server");
        self.env.display_to_console("Starting server");

        let execution = self.definition.read().execution.clone();
        if let Err(e) = self.run_pipeline(&execution.pre_execution, Bindings::new()).await {
            error!(server = %self.id, error = %e, "pre-execution failed");
            self.env.display_to_console("Error running pre execute");
            return Err(e);
        }

        let chosen = execution
            .command
            .select(|condition| self.run_condition(condition, &Bindings::new()))
            .and_then(|chosen| {
                if chosen.command.trim().is_empty() {
                    Err(Error::invalid_argument("no start command configured"))
                } else {
                    Ok(chosen)
                }
            });
        let chosen = match chosen {
            Ok(chosen) => chosen,
            Err(e) => {
                error!(server = %self.id, error = %e, "no start command");
                self.env.display_to_console("Failed to start server");
                return Err(e);
            }
        };
        let stdin = if chosen.stdin.is_empty() {
            execution.stdin.clone()
        } else {
            chosen.stdin
        };

        let bindings = self.data_to_map();
        let (program, arguments) = split_arguments(&replace_tokens(&chosen.command, &bindings));
        let weak = Arc::downgrade(self);
        let mut data = ExecutionData::new(program, arguments)
            .with_environment(replace_tokens_in_map(&execution.environment_vars, &bindings))
            .with_variables(bindings)
            .with_stdin(stdin)
            .on_exit(move |code| {
                if let Some(server) = weak.upgrade() {
                    tokio::spawn(async move { server.after_exit(code).await });
                }
            });
        if !execution.working_directory.is_empty() {
            data = data.with_working_directory(execution.working_directory.clone());
        }

        if let Err(e) = self.env.execute_async(data).await {
            error!(server = %self.id, error = %e, "failed to start server");
            self.env.display_to_console("Failed to start server");
            return Err(e);
        }

        self.start_keepalive(&execution.keep_alive);
        Ok(())
    }

    /// Ask the server to stop: stop signal, stop command, or a kill when
    /// neither is configured. Does not wait for the exit.
    pub async fn stop(&self) -> Result<()> {
        if !self.env.is_running().await {
            return Ok(());
        }

        info!(server = %self.id, "stopping server");
        let (code, command) = {
            let def = self.definition.read();
            (def.execution.stop_code, def.execution.stop_command.clone())
        };
        let result = if code != 0 {
            self.env.send_code(code).await
        } else if !command.is_empty() {
            let command = replace_tokens(&command, &self.data_to_map());
            self.env.execute_in_main_process(&command).await
        } else {
            self.env.kill().await
        };

        match &result {
            Ok(()) => self.env.display_to_console("Server was told to stop"),
            Err(e) => {
                error!(server = %self.id, error = %e, "failed to stop server");
                self.env.display_to_console("Failed to stop server");
            }
        }
        result
    }

    pub async fn kill(&self) -> Result<()> {
        info!(server = %self.id, "killing server");
        match self.env.kill().await {
            Ok(()) => {
                self.env.display_to_console("Server killed");
                Ok(())
            }
            Err(e) => {
                error!(server = %self.id, error = %e, "failed to kill server");
                self.env.display_to_console("Failed to kill server");
                Err(e)
            }
        }
    }

    /// Write a line to the server's console input
    pub async fn execute(&self, command: &str) -> Result<()> {
        self.env.execute_in_main_process(command).await
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        self.env.stats().await
    }

    /// Run the installation steps to completion
    pub async fn install(&self) -> Result<()> {
        let _installing = self.claim(Activity::Installing).await?;
        self.env.set_installing(true);
        let result = self.run_install().await;
        self.env.set_installing(false);
        result
    }

    /// Install in the background; progress shows on the console
    pub async fn start_install(self: &Arc<Self>) -> Result<()> {
        let installing = self.claim(Activity::Installing).await?;
        self.env.set_installing(true);
        let server = self.clone();
        tokio::spawn(async move {
            let _ = server.run_install().await;
            server.env.set_installing(false);
            drop(installing);
        });
        Ok(())
    }

    async fn run_install(&self) -> Result<()> {
        info!(server = %self.id, "installing server");
        self.env.display_to_console("Installing server");

        let result = async {
            self.env.create().await?;
            let installation = self.definition.read().installation.clone();
            if !installation.is_empty() {
                self.run_pipeline(&installation, Bindings::new()).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        match &result {
            Ok(()) => self.env.display_to_console("Server installed"),
            Err(e) => {
                error!(server = %self.id, error = %e, "install failed");
                self.env.display_to_console("Failed to install server");
            }
        }
        result
    }

    /// Run the uninstall steps, then remove the root, backups and
    /// every file describing this server
    pub async fn destroy(&self) -> Result<()> {
        let _destroying = self.claim(Activity::Destroying).await?;
        info!(server = %self.id, "destroying server");

        self.scheduler.stop();
        self.stop_keepalive();

        let uninstallation = self.definition.read().uninstallation.clone();
        if !uninstallation.is_empty() {
            if let Err(e) = self.run_pipeline(&uninstallation, Bindings::new()).await {
                error!(server = %self.id, error = %e, "uninstall failed");
                self.env.display_to_console("Failed to uninstall server");
                return Err(e);
            }
        }

        self.env.delete().await?;
        for path in [
            self.ctx.config.server_file(&self.id),
            self.ctx.config.schedule_file(&self.id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn get_data(&self) -> HashMap<String, Variable> {
        self.definition.read().data.clone()
    }

    /// Update variable values. Without admin rights only user-editable
    /// variables change; admins may also add new ones.
    pub async fn edit_data(&self, data: HashMap<String, Value>, as_admin: bool) -> Result<()> {
        {
            let mut def = self.definition.write();
            for (key, value) in data {
                match def.data.get_mut(&key) {
                    Some(variable) if as_admin || variable.user_editable => variable.value = value,
                    Some(_) => debug!(server = %self.id, variable = %key, "not user editable, ignored"),
                    None if as_admin => {
                        def.data.insert(key, Variable::new(value));
                    }
                    None => debug!(server = %self.id, variable = %key, "unknown variable, ignored"),
                }
            }
        }
        self.save().await
    }

    /// Persist the definition to `<servers_dir>/<id>.json`
    pub async fn save(&self) -> Result<()> {
        let json = {
            let def = self.definition.read();
            def.validate()?;
            serde_json::to_string_pretty(&*def)?
        };
        debug!(server = %self.id, "saving server");
        tokio::fs::write(self.ctx.config.server_file(&self.id), json).await?;
        Ok(())
    }

    /// Handle a process exit: post-execution steps, crash accounting and
    /// the auto-restart policy
    pub async fn after_exit(&self, exit_code: i32) {
        self.stop_keepalive();

        let execution = self.definition.read().execution.clone();
        let graceful = exit_code == execution.expected_exit_code;
        if graceful {
            self.crashes.store(0, Ordering::SeqCst);
        }

        if !execution.post_execution.is_empty() {
            self.env.display_to_console("Running post-execution steps");
            let extra = Bindings::from([
                ("success".to_string(), Value::Bool(graceful)),
                ("exitCode".to_string(), Value::from(exit_code)),
            ]);
            if let Err(e) = self.run_pipeline(&execution.post_execution, extra).await {
                error!(server = %self.id, error = %e, "post-execution failed");
                self.env.display_to_console("Failed to run post-execution steps");
                return;
            }
        }

        if graceful {
            if execution.auto_restart_from_graceful {
                self.ctx.queue.push(self.id.clone());
            }
            return;
        }

        if !execution.auto_restart_from_crash {
            return;
        }
        let limit = self.ctx.config.crash_limit;
        let crashes = self.crashes.load(Ordering::SeqCst);
        if crashes < limit {
            self.crashes.fetch_add(1, Ordering::SeqCst);
            warn!(server = %self.id, exit_code, crashes = crashes + 1, limit, "server crashed, restarting");
            self.ctx.queue.push(self.id.clone());
        } else {
            warn!(server = %self.id, exit_code, limit, "crash limit reached, not restarting");
            self.env.display_to_console("Server crashed too often, not restarting");
        }
    }

    fn start_keepalive(self: &Arc<Self>, keep_alive: &KeepAlive) {
        if !keep_alive.is_enabled() {
            return;
        }
        let period = match humantime::parse_duration(&keep_alive.frequency) {
            Ok(period) if !period.is_zero() => period,
            Ok(_) => return,
            Err(e) => {
                self.env
                    .display_to_console(&format!("Failed to enable keep-alive: {}", e));
                return;
            }
        };

        let (tx, mut done) = oneshot::channel();
        if let Some(previous) = self.keepalive.lock().replace(tx) {
            let _ = previous.send(());
        }

        let weak = Arc::downgrade(self);
        let command = keep_alive.command.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = &mut done => break,
                    _ = ticker.tick() => {
                        let Some(server) = weak.upgrade() else { break };
                        if let Err(e) = server.env.execute_in_main_process(&command).await {
                            debug!(server = %server.id, error = %e, "keep-alive not delivered");
                        }
                    }
                }
            }
        });
    }

    fn stop_keepalive(&self) {
        if let Some(tx) = self.keepalive.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("id", &self.id).finish()
    }
}
