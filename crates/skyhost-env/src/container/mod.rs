//! Container backend

mod docker;
pub mod ports;
pub mod runtime;

#[cfg(test)]
pub mod mock;

pub use docker::BollardRuntime;
pub use runtime::{ContainerIo, ContainerRuntime, ContainerUsage};

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{ContainerConfig, HostConfig, PortBinding};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use skyhost_core::{
    DaemonConfig, EnvironmentKind, EnvironmentSpec, Error, Result, ServerStats,
    CONTAINER_BINARIES_DIR, DEFAULT_CONTAINER_IMAGE, DEFAULT_CONTAINER_ROOT, SERVER_LABEL,
    STATS_CACHE_SECS,
};

use crate::jvm::parse_heap_info;
use crate::state::EnvState;
use crate::stdin::PipeInput;
use crate::traits::{ExecutionData, Executor};

/// Exit code recorded when waiting on the container fails
const WAIT_FAILED_EXIT_CODE: i32 = -999;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-server container settings from the environment definition
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerSettings {
    pub image: String,
    pub network_mode: String,
    pub ports: Vec<String>,
    /// Host path to container path
    pub binds: HashMap<String, String>,
    pub config: Option<ContainerConfig>,
    pub host_config: Option<HostConfig>,
}

impl DockerSettings {
    pub fn from_spec(spec: &EnvironmentSpec) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(spec.settings.clone()))
            .map_err(|e| Error::invalid_argument(format!("invalid docker settings: {}", e)))
    }

    /// Image reference with an explicit tag
    pub fn image(&self) -> String {
        let image = if self.image.is_empty() { DEFAULT_CONTAINER_IMAGE } else { self.image.as_str() };
        normalize_image(image)
    }

    fn user_ids(&self) -> (i32, i32) {
        let user = self.config.as_ref().and_then(|c| c.user.as_deref()).unwrap_or("");
        let mut parts = user.splitn(2, ':');
        let uid = parts.next().and_then(|u| u.parse().ok()).unwrap_or(-1);
        let gid = parts.next().and_then(|g| g.parse().ok()).unwrap_or(uid);
        (uid, gid)
    }
}

/// Append `:latest` when no tag or digest is given
pub fn normalize_image(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Host-side locations the backend needs
#[derive(Debug, Clone, Default)]
pub struct ContainerPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub binaries_dir: PathBuf,
    /// Host path of `data_dir` when the daemon itself runs in a container
    pub docker_root: Option<PathBuf>,
}

pub struct ContainerBackend {
    name: String,
    settings: DockerSettings,
    paths: ContainerPaths,
    disallow_host: bool,
    stats_disabled: bool,
    jvm_stats_disabled: bool,
    runtime: Arc<dyn ContainerRuntime>,
    downloading: AtomicBool,
    stats_cache: Mutex<Option<(Instant, ServerStats)>>,
}

impl ContainerBackend {
    pub fn new(
        id: &str,
        spec: &EnvironmentSpec,
        config: &DaemonConfig,
        root: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let paths = ContainerPaths {
            root,
            data_dir: config.data_dir.clone(),
            binaries_dir: config.binaries_dir.clone(),
            docker_root: config.docker.root.clone(),
        };
        Ok(Self::with_settings(id, DockerSettings::from_spec(spec)?, paths, runtime)
            .disallow_host(config.docker.disallow_host)
            .stats_flags(config.security.stats_disabled, config.security.jvm_stats_disabled))
    }

    pub fn with_settings(
        id: &str,
        settings: DockerSettings,
        paths: ContainerPaths,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            name: id.to_string(),
            settings,
            paths,
            disallow_host: false,
            stats_disabled: false,
            jvm_stats_disabled: false,
            runtime,
            downloading: AtomicBool::new(false),
            stats_cache: Mutex::new(None),
        }
    }

    pub fn disallow_host(mut self, disallow: bool) -> Self {
        self.disallow_host = disallow;
        self
    }

    pub fn stats_flags(mut self, stats_disabled: bool, jvm_stats_disabled: bool) -> Self {
        self.stats_disabled = stats_disabled;
        self.jvm_stats_disabled = jvm_stats_disabled;
        self
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// Make sure `image` is present. Only one pull runs per server;
    /// a concurrent request fails with `ImageDownloading`.
    pub async fn pull_image(&self, state: &EnvState, image: &str, force: bool) -> Result<()> {
        let image = normalize_image(image);
        if !force && self.runtime.image_exists(&image).await? {
            return Ok(());
        }
        if self
            .downloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ImageDownloading);
        }

        state.display(&format!("Downloading image {}", image));
        let pulled = self.runtime.pull_image(&image).await;
        self.downloading.store(false, Ordering::SeqCst);
        pulled?;
        state.display(&format!("Downloaded image {}", image));
        Ok(())
    }

    async fn launch(&self, state: &Arc<EnvState>, data: ExecutionData, image: &str) -> Result<()> {
        self.runtime.remove_container(&self.name).await?;
        let source = self.host_root().await?;
        let config = self.container_config(image, &data, &source)?;
        self.runtime.create_container(&self.name, config).await?;

        let io = self.runtime.attach(&self.name).await?;
        state.set_pipe(Some(Box::new(PipeInput::from_boxed(io.input)))).await;

        let mut output = io.output;
        let console = state.clone();
        let output_task = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bytes) => console.write_console(&bytes),
                    Err(e) => {
                        warn!(server = %console.id(), "console stream ended: {}", e);
                        break;
                    }
                }
            }
        });

        let runtime = self.runtime.clone();
        let name = self.name.clone();
        let wait = tokio::spawn(async move { runtime.wait_container(&name).await });

        if let Err(e) = self.runtime.start_container(&self.name).await {
            wait.abort();
            output_task.abort();
            let _ = self.runtime.remove_container(&self.name).await;
            return Err(e);
        }
        info!(server = %self.name, image, "container started");

        let state = state.clone();
        let callback = data.callback;
        tokio::spawn(async move {
            let code = match wait.await {
                Ok(Ok(code)) => code as i32,
                Ok(Err(e)) => {
                    error!(server = %state.id(), "failed waiting for container: {}", e);
                    state.display(&format!("Error waiting on container: {}", e));
                    WAIT_FAILED_EXIT_CODE
                }
                Err(e) => {
                    error!(server = %state.id(), "container wait task failed: {}", e);
                    WAIT_FAILED_EXIT_CODE
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output_task).await.is_err() {
                warn!(server = %state.id(), "console stream did not close after exit");
            }
            state.finish(code, callback).await;
        });

        Ok(())
    }

    /// Full create request: user settings plus the fixed overrides.
    /// `source` is the server root as the engine sees it.
    pub fn container_config(&self, image: &str, data: &ExecutionData, source: &Path) -> Result<Config<String>> {
        let base = self.settings.config.clone().unwrap_or_default();

        let mut labels = base.labels.unwrap_or_default();
        labels.insert(SERVER_LABEL.to_string(), self.name.clone());

        let mut env = base.env.unwrap_or_default();
        let mut extra: Vec<_> = data.environment.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        extra.sort();
        env.extend(extra);

        let container_root = base
            .working_dir
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTAINER_ROOT.to_string());
        let working_dir = if data.working_directory.is_empty() {
            container_root.clone()
        } else {
            let mut dir = PathBuf::from(&container_root);
            for part in skyhost_files::clean_path(&data.working_directory)? {
                dir.push(part);
            }
            dir.to_string_lossy().into_owned()
        };

        let mut cmd = vec![data.command.clone()];
        cmd.extend(data.arguments.iter().cloned());

        let mut host = self.settings.host_config.clone().unwrap_or_default();
        let network_mode = if !self.settings.network_mode.is_empty() {
            self.settings.network_mode.clone()
        } else {
            host.network_mode.clone().unwrap_or_else(|| "host".to_string())
        };
        if network_mode == "host" && self.disallow_host {
            return Err(Error::docker("host networking is not allowed on this node"));
        }
        host.network_mode = Some(network_mode);
        host.auto_remove = Some(true);

        let mut binds = host.binds.take().unwrap_or_default();
        binds.push(format!("{}:{}", source.display(), container_root));
        if self.paths.binaries_dir.exists() {
            binds.push(format!("{}:{}", self.paths.binaries_dir.display(), CONTAINER_BINARIES_DIR));
        }
        let mut user_binds: Vec<_> = self.settings.binds.iter().map(|(h, c)| format!("{}:{}", h, c)).collect();
        user_binds.sort();
        binds.extend(user_binds);
        host.binds = Some(binds);

        let mut port_bindings = host.port_bindings.take().unwrap_or_default();
        port_bindings.extend(ports::port_map(&self.settings.ports)?);
        if data.stdin.kind.eq_ignore_ascii_case("telnet") || data.stdin.kind.eq_ignore_ascii_case("rcon") {
            if !data.stdin.port.is_empty() {
                let ip = if data.stdin.ip.is_empty() { "127.0.0.1" } else { data.stdin.ip.as_str() };
                port_bindings.insert(
                    format!("{}/tcp", data.stdin.port),
                    Some(vec![PortBinding {
                        host_ip: Some(ip.to_string()),
                        host_port: Some(data.stdin.port.clone()),
                    }]),
                );
            }
        }
        let mut exposed = base.exposed_ports.unwrap_or_default();
        for key in port_bindings.keys() {
            exposed.entry(key.clone()).or_default();
        }
        host.port_bindings = Some(port_bindings);

        Ok(Config {
            image: Some(image.to_string()),
            hostname: base.hostname,
            user: base.user,
            entrypoint: base.entrypoint,
            stop_signal: base.stop_signal,
            exposed_ports: Some(exposed),
            env: Some(env),
            cmd: Some(cmd),
            working_dir: Some(working_dir),
            labels: Some(labels),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(true),
            network_disabled: Some(false),
            host_config: Some(host),
            ..Default::default()
        })
    }

    /// Server root as the engine sees it
    async fn host_root(&self) -> Result<PathBuf> {
        if let Some(base) = &self.paths.docker_root {
            return Ok(remap(&self.paths.root, &self.paths.data_dir, base));
        }
        if Path::new("/.dockerenv").exists() {
            if let Ok(hostname) = nix::unistd::gethostname() {
                let hostname = hostname.to_string_lossy().into_owned();
                let data_dir = self.paths.data_dir.to_string_lossy().into_owned();
                if let Some(source) = self.runtime.mount_source(&hostname, &data_dir).await? {
                    return Ok(remap(&self.paths.root, &self.paths.data_dir, &source));
                }
            }
        }
        Ok(self.paths.root.clone())
    }

    fn cached_stats(&self) -> Option<ServerStats> {
        self.stats_cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < Duration::from_secs(STATS_CACHE_SECS))
            .map(|(_, stats)| stats.clone())
    }
}

fn remap(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

#[async_trait]
impl Executor for ContainerBackend {
    async fn execute_async(&self, state: Arc<EnvState>, data: ExecutionData) -> Result<()> {
        let image = self.settings.image();
        self.pull_image(&state, &image, false).await?;

        state.try_claim()?;
        if let Err(e) = self.launch(&state, data, &image).await {
            state.release();
            return Err(e);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if !self.is_running().await {
            return Ok(());
        }
        self.runtime.kill_container(&self.name, "SIGKILL").await
    }

    async fn is_running(&self) -> bool {
        match self.runtime.is_running(&self.name).await {
            Ok(running) => running,
            Err(e) => {
                warn!(server = %self.name, "failed to inspect container: {}", e);
                false
            }
        }
    }

    async fn stats(&self) -> Result<ServerStats> {
        if self.stats_disabled {
            return Ok(ServerStats::default());
        }
        if let Some(stats) = self.cached_stats() {
            return Ok(stats);
        }
        if !self.is_running().await {
            return Err(Error::ServerOffline);
        }

        let usage = self.runtime.stats(&self.name).await?;
        let jvm = if self.jvm_stats_disabled {
            None
        } else {
            let command = vec!["jcmd".to_string(), "1".to_string(), "GC.heap_info".to_string()];
            match self.runtime.exec(&self.name, command).await {
                Ok(output) => parse_heap_info(&output),
                Err(_) => None,
            }
        };

        let stats = ServerStats {
            cpu: usage.cpu_percent(),
            memory: usage.memory as f64,
            jvm,
        };
        *self.stats_cache.lock() = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }

    async fn send_code(&self, code: i32) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::ServerOffline);
        }
        self.runtime.kill_container(&self.name, &code.to_string()).await
    }

    fn uid(&self) -> i32 {
        self.settings.user_ids().0
    }

    fn gid(&self) -> i32 {
        self.settings.user_ids().1
    }

    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRuntime;
    use super::*;
    use serde_json::json;
    use skyhost_core::StdinConfiguration;

    fn backend(runtime: Arc<MockRuntime>, settings: DockerSettings) -> ContainerBackend {
        let paths = ContainerPaths {
            root: PathBuf::from("/var/lib/skyhost/servers/alpha"),
            data_dir: PathBuf::from("/var/lib/skyhost"),
            binaries_dir: PathBuf::from("/nonexistent-binaries"),
            docker_root: None,
        };
        ContainerBackend::with_settings("alpha", settings, paths, runtime).stats_flags(false, false)
    }

    fn state() -> Arc<EnvState> {
        Arc::new(EnvState::new("alpha", EnvironmentKind::Docker, 64 * 1024, false))
    }

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("ubuntu"), "ubuntu:latest");
        assert_eq!(normalize_image("ubuntu:22.04"), "ubuntu:22.04");
        assert_eq!(normalize_image("registry:5000/game"), "registry:5000/game:latest");
        assert_eq!(normalize_image("game@sha256:abc"), "game@sha256:abc");
    }

    #[test]
    fn test_settings_from_spec() {
        let spec: EnvironmentSpec = serde_json::from_value(json!({
            "type": "docker",
            "image": "eclipse-temurin:21",
            "networkMode": "bridge",
            "ports": ["25565"],
            "config": {"User": "1000:1001"}
        }))
        .unwrap();
        let settings = DockerSettings::from_spec(&spec).unwrap();
        assert_eq!(settings.image(), "eclipse-temurin:21");
        assert_eq!(settings.network_mode, "bridge");
        assert_eq!(settings.user_ids(), (1000, 1001));
        assert_eq!(DockerSettings::default().user_ids(), (-1, -1));
        assert_eq!(DockerSettings::default().image(), normalize_image(DEFAULT_CONTAINER_IMAGE));
    }

    #[test]
    fn test_container_config_overrides() {
        let runtime = Arc::new(MockRuntime::new());
        let settings = DockerSettings {
            network_mode: "bridge".into(),
            ports: vec!["25565:25565".into()],
            ..Default::default()
        };
        let backend = backend(runtime, settings);
        let data = ExecutionData::new("java", vec!["-jar".into(), "server.jar".into()])
            .with_working_directory("game")
            .with_stdin(StdinConfiguration {
                kind: "rcon".into(),
                port: "25575".into(),
                ..Default::default()
            });

        let root = PathBuf::from("/var/lib/skyhost/servers/alpha");
        let config = backend.container_config("java:latest", &data, &root).unwrap();
        assert_eq!(config.cmd.unwrap(), vec!["java", "-jar", "server.jar"]);
        assert_eq!(config.working_dir.unwrap(), format!("{}/game", DEFAULT_CONTAINER_ROOT));
        assert_eq!(config.labels.unwrap()[SERVER_LABEL], "alpha");
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));

        let host = config.host_config.unwrap();
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            host.binds.unwrap(),
            vec![format!("/var/lib/skyhost/servers/alpha:{}", DEFAULT_CONTAINER_ROOT)]
        );
        let ports = host.port_bindings.unwrap();
        assert!(ports.contains_key("25565/tcp"));
        assert!(ports.contains_key("25575/tcp"));
    }

    #[test]
    fn test_host_network_can_be_disallowed() {
        let runtime = Arc::new(MockRuntime::new());
        let backend = backend(runtime, DockerSettings::default()).disallow_host(true);
        let data = ExecutionData::new("true", vec![]);
        let result = backend.container_config("x:latest", &data, Path::new("/srv"));
        assert!(matches!(result, Err(Error::Docker(_))));
    }

    #[test]
    fn test_remap_root() {
        assert_eq!(
            remap(Path::new("/data/servers/a"), Path::new("/data"), Path::new("/host/volumes/data")),
            PathBuf::from("/host/volumes/data/servers/a")
        );
        assert_eq!(
            remap(Path::new("/other/a"), Path::new("/data"), Path::new("/host")),
            PathBuf::from("/other/a")
        );
    }

    #[tokio::test]
    async fn test_concurrent_start_pulls_once() {
        let runtime = Arc::new(MockRuntime::with_pull_delay(Duration::from_millis(200)));
        let backend = Arc::new(backend(runtime.clone(), DockerSettings::default()));
        let state = state();

        let first = {
            let backend = backend.clone();
            let state = state.clone();
            tokio::spawn(async move { backend.execute_async(state, ExecutionData::new("run", vec![])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = backend.execute_async(state.clone(), ExecutionData::new("run", vec![])).await;

        assert!(matches!(second, Err(Error::ImageDownloading)));
        first.await.unwrap().unwrap();
        assert_eq!(runtime.pull_count(), 1);
        assert!(state.is_running());
        assert!(matches!(
            backend.execute_async(state.clone(), ExecutionData::new("run", vec![])).await,
            Err(Error::ProcessRunning)
        ));
    }

    #[tokio::test]
    async fn test_output_kill_and_exit_code() {
        let image = normalize_image(DEFAULT_CONTAINER_IMAGE);
        let runtime = Arc::new(MockRuntime::new().with_image(&image));
        let backend = backend(runtime.clone(), DockerSettings::default());
        let state = state();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let data = ExecutionData::new("run", vec![]).on_exit(move |code| {
            let _ = tx.send(code);
        });
        backend.execute_async(state.clone(), data).await.unwrap();
        assert_eq!(runtime.pull_count(), 0);

        runtime.emit("alpha", "Done (1.2s)!\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.console().read_all().0.contains("Done (1.2s)!"));

        let stats = backend.stats().await.unwrap();
        assert!((stats.cpu - 20.0).abs() < 1e-9);
        assert_eq!(stats.jvm.unwrap().heap_used, 512 * 1024);

        backend.send_code(15).await.unwrap();
        assert_eq!(runtime.signals().last().unwrap().1, "15");

        backend.kill().await.unwrap();
        assert_eq!(rx.await.unwrap(), mock::KILLED_EXIT_CODE as i32);
        assert!(!state.is_running());
        assert!(!backend.is_running().await);
        backend.kill().await.unwrap();
        assert!(matches!(backend.send_code(15).await, Err(Error::ServerOffline)));
    }

    #[tokio::test]
    async fn test_exit_reported_only_after_container_stops() {
        let image = normalize_image(DEFAULT_CONTAINER_IMAGE);
        let runtime = Arc::new(MockRuntime::new().with_image(&image));
        let backend = backend(runtime.clone(), DockerSettings::default());
        let state = state();
        let (tx, mut rx) = tokio::sync::oneshot::channel();

        let data = ExecutionData::new("run", vec![]).on_exit(move |code| {
            let _ = tx.send(code);
        });
        backend.execute_async(state.clone(), data).await.unwrap();
        assert_eq!(runtime.lifecycle("alpha"), Some(mock::Lifecycle::Running));

        // The exit watch is registered before start and must keep waiting
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(state.is_running());
        assert!(backend.is_running().await);

        runtime.exit("alpha", 3);
        assert_eq!(rx.await.unwrap(), 3);
        assert!(!state.is_running());
        assert_eq!(runtime.lifecycle("alpha"), Some(mock::Lifecycle::Removed(3)));
        assert!(runtime.created().is_empty());
    }
}
