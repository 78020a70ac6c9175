//! In-memory container engine for tests

use async_trait::async_trait;
use bollard::container::Config;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use skyhost_core::{Error, Result};

use super::runtime::{ContainerIo, ContainerRuntime, ContainerUsage};

/// Exit code reported for killed containers
pub const KILLED_EXIT_CODE: i64 = 137;

/// Container lifecycle as the engine reports it. Containers are created
/// with auto-remove, so an exit goes straight to `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Removed(i64),
}

#[derive(Default)]
pub struct MockRuntime {
    images: Mutex<HashSet<String>>,
    pull_delay: Duration,
    pulls: AtomicUsize,
    created: Mutex<Vec<(String, Config<String>)>>,
    running: Mutex<HashSet<String>>,
    lifecycles: Mutex<HashMap<String, watch::Sender<Lifecycle>>>,
    outputs: Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>,
    signals: Mutex<Vec<(String, String)>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: delay,
            ..Default::default()
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.images.lock().insert(image.to_string());
        self
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<(String, Config<String>)> {
        self.created.lock().clone()
    }

    pub fn signals(&self) -> Vec<(String, String)> {
        self.signals.lock().clone()
    }

    /// Emit output on a running container's stream
    pub fn emit(&self, name: &str, text: &str) {
        if let Some(tx) = self.outputs.lock().get(name) {
            let _ = tx.send(Bytes::from(text.to_string()));
        }
    }

    pub fn lifecycle(&self, name: &str) -> Option<Lifecycle> {
        self.lifecycles.lock().get(name).map(|tx| *tx.borrow())
    }

    /// Let a started container exit on its own
    pub fn exit(&self, name: &str, code: i64) {
        if self.lifecycle(name) != Some(Lifecycle::Running) {
            return;
        }
        self.running.lock().remove(name);
        self.outputs.lock().remove(name);
        self.created.lock().retain(|(n, _)| n != name);
        if let Some(tx) = self.lifecycles.lock().get(name) {
            tx.send_replace(Lifecycle::Removed(code));
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.lock().contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pull_delay).await;
        self.images.lock().insert(image.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.created.lock().retain(|(n, _)| n != name);
        let mut lifecycles = self.lifecycles.lock();
        if lifecycles.get(name).map(|tx| *tx.borrow()) == Some(Lifecycle::Created) {
            lifecycles.remove(name);
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<()> {
        let mut created = self.created.lock();
        if created.iter().any(|(n, _)| n == name) {
            return Err(Error::ContainerExists(name.to_string()));
        }
        created.push((name.to_string(), config));
        let (tx, _) = watch::channel(Lifecycle::Created);
        self.lifecycles.lock().insert(name.to_string(), tx);
        Ok(())
    }

    async fn attach(&self, name: &str) -> Result<ContainerIo> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outputs.lock().insert(name.to_string(), tx);
        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        })
        .boxed();
        Ok(ContainerIo {
            output,
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let lifecycles = self.lifecycles.lock();
        let tx = lifecycles
            .get(name)
            .filter(|tx| *tx.borrow() == Lifecycle::Created)
            .ok_or_else(|| Error::docker(format!("no such container {}", name)))?;
        self.running.lock().insert(name.to_string());
        tx.send_replace(Lifecycle::Running);
        Ok(())
    }

    /// Resolves once the container is removed, never on the created state
    async fn wait_container(&self, name: &str) -> Result<i64> {
        let mut rx = self
            .lifecycles
            .lock()
            .get(name)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::docker(format!("no such container {}", name)))?;
        let state = *rx
            .wait_for(|state| matches!(state, Lifecycle::Removed(_)))
            .await
            .map_err(|_| Error::docker("container vanished"))?;
        match state {
            Lifecycle::Removed(code) => Ok(code),
            _ => Err(Error::docker("container vanished")),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.running.lock().contains(name))
    }

    async fn kill_container(&self, name: &str, signal: &str) -> Result<()> {
        self.signals.lock().push((name.to_string(), signal.to_string()));
        if signal == "SIGKILL" || signal == "9" {
            self.exit(name, KILLED_EXIT_CODE);
        }
        Ok(())
    }

    async fn stats(&self, _name: &str) -> Result<ContainerUsage> {
        Ok(ContainerUsage {
            cpu_total: 200,
            precpu_total: 100,
            system_total: 1100,
            presystem_total: 100,
            online_cpus: 2,
            memory: 512 * 1024 * 1024,
        })
    }

    async fn exec(&self, _name: &str, _command: Vec<String>) -> Result<String> {
        Ok(" garbage-first heap   total 1024K, used 512K [0x0, 0x0)\n".to_string())
    }

    async fn mount_source(&self, _name: &str, _destination: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}
