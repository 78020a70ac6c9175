//! Docker engine access through bollard

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::path::PathBuf;
use tracing::{debug, info};

use skyhost_core::{Error, Result};

use super::runtime::{ContainerIo, ContainerRuntime, ContainerUsage};

/// Wait condition for the exit watch. The wait is registered before the
/// container starts, and a "not-running" wait would resolve at once on a
/// created container. Containers are auto-removed, so "removed" fires
/// exactly once, after the real exit.
const WAIT_CONDITION: &str = "removed";

fn is_not_found(error: &BollardError) -> bool {
    matches!(error, BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404)
}

fn docker_error(action: &str, name: &str, error: BollardError) -> Error {
    Error::docker(format!("{} {}: {}", action, name, error))
}

/// Local Docker engine
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::docker(format!("connect to docker: {}", e)))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(docker_error("inspect image", image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(step) = progress.next().await {
            let step = step.map_err(|e| docker_error("pull", image, e))?;
            if let Some(status) = step.status {
                debug!(image, "{}", status);
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("remove container", name, e)),
        }
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<()> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError { status_code: 409, .. } => Error::ContainerExists(name.to_string()),
                e => docker_error("create container", name, e),
            })?;
        Ok(())
    }

    async fn attach(&self, name: &str) -> Result<ContainerIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| docker_error("attach", name, e))?;

        let name = name.to_string();
        let output = output
            .map(move |chunk| {
                chunk
                    .map(|log| log.into_bytes())
                    .map_err(|e| docker_error("read output", &name, e))
            })
            .boxed();
        Ok(ContainerIo { output, input })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_error("start container", name, e))
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: WAIT_CONDITION,
        };
        let mut waits = Box::pin(self.docker.wait_container(name, Some(options)));
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(docker_error("wait container", name, e)),
            None => Err(Error::docker(format!("wait container {}: no response", name))),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(docker_error("inspect container", name, e)),
        }
    }

    async fn kill_container(&self, name: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("kill container", name, e)),
        }
    }

    async fn stats(&self, name: &str) -> Result<ContainerUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let stats = Box::pin(self.docker.stats(name, Some(options)))
            .try_next()
            .await
            .map_err(|e| docker_error("stats", name, e))?
            .ok_or_else(|| Error::docker(format!("stats {}: empty response", name)))?;

        Ok(ContainerUsage {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_total: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory: stats.memory_stats.usage.unwrap_or(0),
        })
    }

    async fn exec(&self, name: &str, command: Vec<String>) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error("create exec", name, e))?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error("start exec", name, e))?
        {
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|e| docker_error("exec output", name, e))?;
                collected.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }
        Ok(collected)
    }

    async fn mount_source(&self, name: &str, destination: &str) -> Result<Option<PathBuf>> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_error("inspect container", name, e))?;
        Ok(info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .find(|m| m.destination.as_deref() == Some(destination))
            .and_then(|m| m.source)
            .map(PathBuf::from))
    }
}
