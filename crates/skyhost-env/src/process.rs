//! Namespace-sandboxed process backend

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{error, info, warn};

use skyhost_core::{
    DaemonConfig, EnvironmentKind, Error, Result, ServerStats, STATS_CACHE_SECS,
    STRIPPED_ENV_PREFIX,
};

use crate::isolation::IsolationPolicy;
use crate::jvm::attach_heap_info;
use crate::state::EnvState;
use crate::stdin::PipeInput;
use crate::traits::{ExecutionData, Executor};

#[derive(Debug, Clone, Default)]
pub struct ProcessSettings {
    pub root: PathBuf,
    pub binaries_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub extra_mounts: Vec<String>,
    pub sandbox_dir: Option<PathBuf>,
    /// Run the command directly, without namespaces
    pub disable_unshare: bool,
    pub stats_disabled: bool,
    pub jvm_stats_disabled: bool,
}

impl ProcessSettings {
    pub fn from_config(config: &DaemonConfig, root: PathBuf) -> Self {
        Self {
            root,
            binaries_dir: config.binaries_dir.clone(),
            cache_dir: config.cache_dir.clone(),
            extra_mounts: config.security.extra_mounts.clone(),
            sandbox_dir: config.security.sandbox_dir.clone(),
            disable_unshare: config.security.disable_unshare,
            stats_disabled: config.security.stats_disabled,
            jvm_stats_disabled: config.security.jvm_stats_disabled,
        }
    }

    /// Working directory under the root; escapes are rejected
    fn working_directory(&self, relative: &str) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        for part in skyhost_files::clean_path(relative)? {
            dir.push(part);
        }
        Ok(dir)
    }
}

pub struct ProcessBackend {
    settings: ProcessSettings,
    pid: Arc<Mutex<Option<u32>>>,
    system: Mutex<System>,
    stats_cache: Mutex<Option<(Instant, ServerStats)>>,
}

impl ProcessBackend {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings,
            pid: Arc::new(Mutex::new(None)),
            system: Mutex::new(System::new()),
            stats_cache: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    async fn spawn(&self, state: &Arc<EnvState>, data: ExecutionData) -> Result<()> {
        let ExecutionData {
            command,
            arguments,
            environment,
            working_directory,
            callback,
            ..
        } = data;

        let cwd = self.settings.working_directory(&working_directory)?;
        tokio::fs::create_dir_all(&cwd).await?;

        // Shared runtimes (`java21`, `node20`) resolve through PATH
        let mut search = Vec::new();
        if !self.settings.binaries_dir.as_os_str().is_empty() {
            search.push(self.settings.binaries_dir.clone());
        }
        search.extend(std::env::var_os("PATH").iter().flat_map(std::env::split_paths));
        let path = std::env::join_paths(search)
            .map_err(|e| Error::process_start(format!("invalid PATH: {}", e)))?;

        let mut cmd = Command::new(&command);
        cmd.args(&arguments)
            .current_dir(&cwd)
            .env_clear()
            .envs(std::env::vars().filter(|(k, _)| !k.starts_with(STRIPPED_ENV_PREFIX)))
            .env("HOME", &self.settings.root)
            .env("TERM", "xterm-256color")
            .env("PATH", &path)
            .envs(&environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let sandbox = if self.settings.disable_unshare {
            None
        } else {
            let shared = [
                self.settings.root.clone(),
                self.settings.binaries_dir.clone(),
                self.settings.cache_dir.clone(),
            ];
            let policy = IsolationPolicy::new(&shared, &self.settings.extra_mounts, &cwd);
            let prepared = policy.prepare(self.settings.sandbox_dir.as_deref())?;
            let plan = prepared.plan();
            // SAFETY: the hook only issues syscalls on data prepared before fork
            unsafe {
                cmd.pre_exec(move || plan.enter());
            }
            Some(prepared)
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::process_start(format!("Failed to start '{}': {}", command, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::process_start("Process started but no PID available"))?;
        *self.pid.lock() = Some(pid);
        info!(server = %state.id(), pid, command = %command, "process started");

        if let Some(stdin) = child.stdin.take() {
            state.set_pipe(Some(Box::new(PipeInput::new(stdin)))).await;
        }
        let output = tokio::spawn(stream_output(
            state.clone(),
            child.stdout.take(),
            child.stderr.take(),
        ));

        let state = state.clone();
        let pid_slot = self.pid.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    error!(server = %state.id(), "failed waiting for process: {}", e);
                    -1
                }
            };
            let _ = output.await;
            pid_slot.lock().take();
            drop(sandbox);
            state.finish(code, callback).await;
        });

        Ok(())
    }

    fn cached_stats(&self) -> Option<ServerStats> {
        let cache = self.stats_cache.lock();
        cache
            .as_ref()
            .filter(|(at, _)| at.elapsed() < Duration::from_secs(STATS_CACHE_SECS))
            .map(|(_, stats)| stats.clone())
    }
}

#[async_trait]
impl Executor for ProcessBackend {
    async fn execute_async(&self, state: Arc<EnvState>, data: ExecutionData) -> Result<()> {
        state.try_claim()?;
        if let Err(e) = self.spawn(&state, data).await {
            state.release();
            return Err(e);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::OperationFailed(format!("Failed to kill process {}: {}", pid, e))),
        }
    }

    async fn is_running(&self) -> bool {
        match self.pid() {
            Some(pid) => kill(Pid::from_raw(pid as i32), None).is_ok(),
            None => false,
        }
    }

    async fn stats(&self) -> Result<ServerStats> {
        if self.settings.stats_disabled {
            return Ok(ServerStats::default());
        }
        let pid = self.pid().ok_or(Error::ServerOffline)?;
        if let Some(stats) = self.cached_stats() {
            return Ok(stats);
        }

        let (cpu, memory, is_java) = {
            let mut system = self.system.lock();
            let spid = sysinfo::Pid::from_u32(pid);
            system.refresh_process(spid);
            let process = system.process(spid).ok_or(Error::ServerOffline)?;
            (
                process.cpu_usage() as f64,
                process.memory() as f64,
                process.name().contains("java"),
            )
        };

        let jvm = if is_java && !self.settings.jvm_stats_disabled {
            match attach_heap_info(pid).await {
                Ok(jvm) => Some(jvm),
                Err(e) => {
                    warn!(pid, "jvm stats unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let stats = ServerStats { cpu, memory, jvm };
        *self.stats_cache.lock() = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }

    async fn send_code(&self, code: i32) -> Result<()> {
        let pid = self.pid().ok_or(Error::ServerOffline)?;
        let signal = Signal::try_from(code)
            .map_err(|_| Error::invalid_argument(format!("unknown signal {}", code)))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::OperationFailed(format!("Failed to signal process {}: {}", pid, e)))
    }

    fn uid(&self) -> i32 {
        -1
    }

    fn gid(&self) -> i32 {
        -1
    }

    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Process
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

/// Copy stdout and stderr into the console until both close
async fn stream_output(state: Arc<EnvState>, mut stdout: Option<ChildStdout>, mut stderr: Option<ChildStderr>) {
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) | Err(_) => stdout = None,
                Ok(n) => state.write_console(&out_buf[..n]),
            },
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) | Err(_) => stderr = None,
                Ok(n) => state.write_console(&err_buf[..n]),
            },
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(root: &TempDir) -> ProcessBackend {
        ProcessBackend::new(ProcessSettings {
            root: root.path().to_path_buf(),
            disable_unshare: true,
            jvm_stats_disabled: true,
            ..Default::default()
        })
    }

    fn state() -> Arc<EnvState> {
        Arc::new(EnvState::new("proc", EnvironmentKind::Process, 64 * 1024, false))
    }

    #[test]
    fn test_working_directory_stays_under_root() {
        let settings = ProcessSettings {
            root: PathBuf::from("/srv/a"),
            ..Default::default()
        };
        assert_eq!(settings.working_directory("").unwrap(), PathBuf::from("/srv/a"));
        assert_eq!(settings.working_directory("game/bin").unwrap(), PathBuf::from("/srv/a/game/bin"));
        assert!(settings.working_directory("../b").is_err());
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let root = TempDir::new().unwrap();
        let backend = backend(&root);
        let state = state();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let data = ExecutionData::new("sh", vec!["-c".into(), "echo hello; echo oops >&2; exit 3".into()])
            .on_exit(move |code| {
                let _ = tx.send(code);
            });
        backend.execute_async(state.clone(), data).await.unwrap();

        assert_eq!(rx.await.unwrap(), 3);
        assert_eq!(state.last_exit_code(), 3);
        assert!(!state.is_running());
        let (logs, _) = state.console().read_all();
        assert!(logs.contains("hello"));
        assert!(logs.contains("oops"));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let root = TempDir::new().unwrap();
        let backend = backend(&root);
        let state = state();

        backend
            .execute_async(state.clone(), ExecutionData::new("sleep", vec!["5".into()]))
            .await
            .unwrap();
        let second = backend
            .execute_async(state.clone(), ExecutionData::new("sleep", vec!["5".into()]))
            .await;
        assert!(matches!(second, Err(Error::ProcessRunning)));
        assert!(backend.is_running().await);

        let mut running = state.subscribe_running();
        backend.kill().await.unwrap();
        running.wait_for(|r| !*r).await.unwrap();
        assert_eq!(state.last_exit_code(), -1);
        backend.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let root = TempDir::new().unwrap();
        let backend = backend(&root);
        let state = state();

        let result = backend
            .execute_async(state.clone(), ExecutionData::new("/nonexistent/binary-12345", vec![]))
            .await;
        assert!(matches!(result, Err(Error::ProcessStartFailed(_))));
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn test_stdin_pipe() {
        let root = TempDir::new().unwrap();
        let backend = backend(&root);
        let state = state();
        let mut running = state.subscribe_running();

        backend
            .execute_async(state.clone(), ExecutionData::new("head", vec!["-n1".into()]))
            .await
            .unwrap();
        state.send_to_pipe("from-console").await.unwrap();
        running.wait_for(|r| !*r).await.unwrap();

        assert!(state.console().read_all().0.contains("from-console"));
        assert_eq!(state.last_exit_code(), 0);
    }

    /// Whether this host lets an unprivileged process open user and mount namespaces
    fn namespaces_available() -> bool {
        use nix::sched::{unshare, CloneFlags};
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new("true");
        // SAFETY: a single syscall between fork and exec
        unsafe {
            cmd.pre_exec(|| {
                unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)?;
                Ok(())
            });
        }
        cmd.status().map(|s| s.success()).unwrap_or(false)
    }

    #[tokio::test]
    async fn test_sandbox_hides_host_and_cleans_up() {
        if !namespaces_available() {
            eprintln!("user namespaces unavailable, skipping sandbox test");
            return;
        }
        let tmp = tempfile::Builder::new().tempdir_in("/tmp").unwrap();
        let root = tmp.path().join("server");
        let secret = tmp.path().join("outside").join("secret.txt");
        let sandboxes = tmp.path().join("sandboxes");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(secret.parent().unwrap()).unwrap();
        std::fs::write(&secret, "hidden").unwrap();

        let backend = ProcessBackend::new(ProcessSettings {
            root: root.clone(),
            sandbox_dir: Some(sandboxes.clone()),
            jvm_stats_disabled: true,
            ..Default::default()
        });
        let state = state();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let script = format!(
            "cat /proc/self/uid_map; if [ -e '{}' ]; then echo host-visible; else echo host-hidden; fi; echo ok > marker.txt",
            secret.display()
        );
        let data = ExecutionData::new("sh", vec!["-c".into(), script]).on_exit(move |code| {
            let _ = tx.send(code);
        });
        backend.execute_async(state.clone(), data).await.unwrap();
        assert_eq!(rx.await.unwrap(), 0);

        let (logs, _) = state.console().read_all();
        assert!(logs.contains("host-hidden"), "{}", logs);
        assert!(!logs.contains("host-visible"));
        let uid = nix::unistd::getuid().as_raw().to_string();
        let mapping = logs
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|fields| fields.len() == 3)
            .unwrap();
        assert_eq!(mapping, vec!["0", uid.as_str(), "1"]);

        // The root is below /tmp and must not be hidden by the sandbox tmpfs
        assert_eq!(std::fs::read_to_string(root.join("marker.txt")).unwrap().trim(), "ok");
        assert_eq!(std::fs::read_dir(&sandboxes).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_binaries_dir_is_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let binaries = TempDir::new().unwrap();
        let tool = binaries.path().join("java21");
        std::fs::write(&tool, "#!/bin/sh\necho runtime-ok\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = ProcessBackend::new(ProcessSettings {
            root: root.path().to_path_buf(),
            binaries_dir: binaries.path().to_path_buf(),
            disable_unshare: true,
            jvm_stats_disabled: true,
            ..Default::default()
        });
        let state = state();
        let mut running = state.subscribe_running();
        backend
            .execute_async(state.clone(), ExecutionData::new("java21", vec![]))
            .await
            .unwrap();
        running.wait_for(|r| !*r).await.unwrap();

        assert_eq!(state.last_exit_code(), 0);
        assert!(state.console().read_all().0.contains("runtime-ok"));
    }

    #[tokio::test]
    async fn test_stats_offline() {
        let root = TempDir::new().unwrap();
        let backend = backend(&root);
        assert!(matches!(backend.stats().await, Err(Error::ServerOffline)));
    }
}
