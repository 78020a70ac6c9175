//! Environment: one server's execution context

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use skyhost_conditions::FunctionRegistry;
use skyhost_core::{
    ConsoleLog, DaemonConfig, EnvironmentKind, EnvironmentSpec, Error, Result, ServerStats,
    ServerStatus,
};
use skyhost_files::{FileServer, Resolver};

use crate::console::ConsoleBuffer;
use crate::container::{BollardRuntime, ContainerBackend, ContainerRuntime};
use crate::process::{ProcessBackend, ProcessSettings};
use crate::state::EnvState;
use crate::stdin::{ConsoleInput, StdinTarget};
use crate::traits::{ExecutionData, Executor};

/// The concrete runtime behind an Environment
pub enum Backend {
    Process(ProcessBackend),
    Container(ContainerBackend),
}

impl Backend {
    fn executor(&self) -> &dyn Executor {
        match self {
            Backend::Process(process) => process,
            Backend::Container(container) => container,
        }
    }
}

pub struct Environment {
    root: PathBuf,
    backup_dir: PathBuf,
    state: Arc<EnvState>,
    backend: Backend,
    files: FileServer,
    stdin_target: Mutex<StdinTarget>,
    proxy: tokio::sync::Mutex<Option<Box<dyn ConsoleInput>>>,
}

impl Environment {
    /// Build the environment named by `spec.kind`. Container environments
    /// use `runtime` when given, otherwise the local Docker engine.
    pub fn new(
        id: &str,
        spec: &EnvironmentSpec,
        config: &DaemonConfig,
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Result<Self> {
        let root = config.server_root(id);
        let backend = match spec.kind()? {
            EnvironmentKind::Process => {
                Backend::Process(ProcessBackend::new(ProcessSettings::from_config(config, root.clone())))
            }
            EnvironmentKind::Docker => {
                let runtime = match runtime {
                    Some(runtime) => runtime,
                    None => Arc::new(BollardRuntime::connect()?),
                };
                Backend::Container(ContainerBackend::new(id, spec, config, root.clone(), runtime)?)
            }
        };
        Ok(Self::with_backend(id, root, config.server_backups(id), backend, config))
    }

    pub fn with_backend(
        id: &str,
        root: PathBuf,
        backup_dir: PathBuf,
        backend: Backend,
        config: &DaemonConfig,
    ) -> Self {
        let executor = backend.executor();
        let owner = (executor.uid() >= 0 && executor.gid() >= 0)
            .then(|| (executor.uid() as u32, executor.gid() as u32));
        let state = Arc::new(EnvState::new(
            id,
            executor.kind(),
            config.console.buffer_size,
            config.console.forward,
        ));
        Self {
            files: FileServer::with_options(&root, owner, Resolver::Auto),
            root,
            backup_dir,
            state,
            backend,
            stdin_target: Mutex::new(StdinTarget::Pipe),
            proxy: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.state.kind()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Jailed view of the server root
    pub fn files(&self) -> &FileServer {
        &self.files
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn console_buffer(&self) -> &ConsoleBuffer {
        self.state.console()
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleLog> {
        self.state.console_tracker().subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ServerStatus> {
        self.state.status_tracker().subscribe()
    }

    pub fn subscribe_stats(&self) -> broadcast::Receiver<ServerStats> {
        self.state.stats_tracker().subscribe()
    }

    pub fn publish_stats(&self, stats: ServerStats) {
        self.state.stats_tracker().publish(stats);
    }

    /// Start a process and return once it runs
    pub async fn execute_async(&self, mut data: ExecutionData) -> Result<()> {
        if self.is_running().await {
            return Err(Error::ProcessRunning);
        }
        data.substitute_tokens();
        *self.stdin_target.lock() = StdinTarget::from_config(&data.stdin);
        *self.proxy.lock().await = None;

        info!(server = %self.id(), command = %data.command_string(), "starting process");
        self.backend.executor().execute_async(self.state.clone(), data).await
    }

    /// Start a process and wait for it, returning the exit code
    pub async fn execute(&self, data: ExecutionData) -> Result<i32> {
        self.execute_async(data).await?;
        self.wait_for_exit().await;
        Ok(self.state.last_exit_code())
    }

    pub async fn wait_for_exit(&self) {
        let mut running = self.state.subscribe_running();
        let _ = running.wait_for(|r| !*r).await;
    }

    /// Wait for the process to exit; past `timeout` it is killed and awaited
    pub async fn wait_for_main_process_for(&self, timeout: Duration) -> Result<()> {
        if tokio::time::timeout(timeout, self.wait_for_exit()).await.is_ok() {
            return Ok(());
        }
        warn!(server = %self.id(), ?timeout, "process did not exit in time, killing");
        self.kill().await?;
        self.wait_for_exit().await;
        Ok(())
    }

    pub async fn kill(&self) -> Result<()> {
        self.backend.executor().kill().await
    }

    pub async fn is_running(&self) -> bool {
        self.state.is_running() || self.backend.executor().is_running().await
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        if !self.is_running().await {
            return Err(Error::ServerOffline);
        }
        self.backend.executor().stats().await
    }

    pub async fn send_code(&self, code: i32) -> Result<()> {
        self.backend.executor().send_code(code).await
    }

    pub fn uid(&self) -> i32 {
        self.backend.executor().uid()
    }

    pub fn gid(&self) -> i32 {
        self.backend.executor().gid()
    }

    /// Daemon message on the server console
    pub fn display_to_console(&self, message: &str) {
        self.state.display(message);
    }

    /// Send a line of input to the running server
    pub async fn execute_in_main_process(&self, command: &str) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::ServerOffline);
        }
        let target = self.stdin_target.lock().clone();
        if !target.is_proxy() {
            return self.state.send_to_pipe(command).await;
        }

        let mut proxy = self.proxy.lock().await;
        if proxy.is_none() {
            *proxy = Some(target.connect().await?);
        }
        if let Some(input) = proxy.as_mut() {
            if let Err(e) = input.send_line(command).await {
                *proxy = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Create the server root
    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        if let Some((uid, gid)) = self.files.owner() {
            std::os::unix::fs::chown(&self.root, Some(uid), Some(gid))?;
        }
        self.files.invalidate();
        Ok(())
    }

    /// Remove the server root and its backups
    pub async fn delete(&self) -> Result<()> {
        if self.is_running().await {
            self.kill().await?;
            self.wait_for_exit().await;
        }
        for dir in [&self.root, &self.backup_dir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.files.invalidate();
        Ok(())
    }

    pub fn is_installing(&self) -> bool {
        self.state.is_installing()
    }

    pub fn set_installing(&self, installing: bool) {
        self.state.set_installing(installing);
    }

    pub fn last_exit_code(&self) -> i32 {
        self.state.last_exit_code()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    /// Condition functions bound to this server
    pub fn functions(&self) -> FunctionRegistry {
        let mut registry = FunctionRegistry::with_builtins();

        let files = self.files.clone();
        registry.register_predicate("file_exists", move |path| files.exists(path));
        registry.register_predicate("in_path", |binary| which::which(binary).is_ok());
        let state = self.state.clone();
        registry.register_flag("is_server_running", move || state.is_running());

        registry
    }

    /// Pull a container image for this server
    pub async fn pull_image(&self, image: &str, force: bool) -> Result<()> {
        match &self.backend {
            Backend::Container(container) => container.pull_image(&self.state, image, force).await,
            Backend::Process(_) => Err(Error::EnvironmentNotSupported(format!(
                "{} environments have no images",
                self.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn environment(tmp: &TempDir) -> Environment {
        let mut config = DaemonConfig::rooted_at(tmp.path());
        config.security.disable_unshare = true;
        config.security.jvm_stats_disabled = true;
        Environment::new("alpha", &EnvironmentSpec::default(), &config, None).unwrap()
    }

    #[tokio::test]
    async fn test_execute_returns_exit_code() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        env.create().await.unwrap();

        let code = env
            .execute(ExecutionData::new("sh", vec!["-c".into(), "exit 4".into()]))
            .await
            .unwrap();
        assert_eq!(code, 4);
        assert_eq!(env.last_exit_code(), 4);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_kills() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        env.create().await.unwrap();

        env.execute_async(ExecutionData::new("sleep", vec!["30".into()]))
            .await
            .unwrap();
        assert!(matches!(
            env.execute_async(ExecutionData::new("sleep", vec!["30".into()])).await,
            Err(Error::ProcessRunning)
        ));

        let started = std::time::Instant::now();
        env.wait_for_main_process_for(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!env.is_running().await);
    }

    #[tokio::test]
    async fn test_console_input_requires_running() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        assert!(matches!(
            env.execute_in_main_process("say hi").await,
            Err(Error::ServerOffline)
        ));
        assert!(matches!(env.stats().await, Err(Error::ServerOffline)));
    }

    #[tokio::test]
    async fn test_tokens_substituted_before_start() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        env.create().await.unwrap();

        let mut variables = skyhost_core::Bindings::new();
        variables.insert("greeting".into(), serde_json::json!("hello-world"));
        let data = ExecutionData::new("echo", vec!["${greeting}".into()]).with_variables(variables);
        env.execute(data).await.unwrap();
        assert!(env.console_buffer().read_all().0.contains("hello-world"));
    }

    #[tokio::test]
    async fn test_functions_bound_to_server() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        env.create().await.unwrap();
        env.files().write("eula.txt", b"eula=true").unwrap();

        let functions = env.functions();
        let bindings = std::collections::HashMap::new();
        assert!(skyhost_conditions::resolve_if(r#"file_exists("eula.txt")"#, &bindings, &functions).unwrap());
        assert!(!skyhost_conditions::resolve_if(r#"file_exists("../alpha")"#, &bindings, &functions).unwrap());
        assert!(skyhost_conditions::resolve_if(r#"in_path("sh")"#, &bindings, &functions).unwrap());
        assert!(!skyhost_conditions::resolve_if("is_server_running()", &bindings, &functions).unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_root() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        env.create().await.unwrap();
        env.files().mkdir_all("world").unwrap();
        env.files().write("world/level.dat", b"x").unwrap();

        env.delete().await.unwrap();
        assert!(!env.root().exists());
        env.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_has_no_images() {
        let tmp = TempDir::new().unwrap();
        let env = environment(&tmp);
        assert!(matches!(
            env.pull_image("alpine", false).await,
            Err(Error::EnvironmentNotSupported(_))
        ));
    }
}
