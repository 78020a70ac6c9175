//! Container engine seam

use async_trait::async_trait;
use bollard::container::Config;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use skyhost_core::Result;

/// Attached stdio of a container
pub struct ContainerIo {
    pub output: BoxStream<'static, Result<Bytes>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// One sample of raw container counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerUsage {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub online_cpus: u64,
    pub memory: u64,
}

impl ContainerUsage {
    /// CPU usage in percent of one core
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total) as f64;
        let system_delta = self.system_total.saturating_sub(self.presystem_total) as f64;
        if cpu_delta <= 0.0 || system_delta <= 0.0 {
            return 0.0;
        }
        let cpus = self.online_cpus.max(1) as f64;
        cpu_delta / system_delta * cpus * 100.0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Force-remove; a missing container is not an error
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<()>;

    async fn attach(&self, name: &str) -> Result<ContainerIo>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Resolve with the exit code once the container stops
    async fn wait_container(&self, name: &str) -> Result<i64>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn kill_container(&self, name: &str, signal: &str) -> Result<()>;

    async fn stats(&self, name: &str) -> Result<ContainerUsage>;

    /// Run a command inside the container and collect its output
    async fn exec(&self, name: &str, command: Vec<String>) -> Result<String>;

    /// Host source of `destination` as mounted into container `name`
    async fn mount_source(&self, name: &str, destination: &str) -> Result<Option<PathBuf>>;
}
