use async_trait::async_trait;

use skyhost_core::Result;
use skyhost_env::Environment;

use crate::operation::{CreateOperation, Operation, OperationResult};

/// `dockerpull{imageName}`: force a fresh pull of the image
pub struct DockerPull {
    image: String,
}

impl DockerPull {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            image: op.string("imageName")?,
        }))
    }
}

#[async_trait]
impl Operation for DockerPull {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Pulling image {}", self.image));
        env.pull_image(&self.image, true).await?;
        Ok(OperationResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyhost_core::{DaemonConfig, EnvironmentSpec, Error};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pull_on_process_environment_unsupported() {
        let tmp = TempDir::new().unwrap();
        let mut config = DaemonConfig::rooted_at(tmp.path());
        config.security.disable_unshare = true;
        let env = Environment::new("pull", &EnvironmentSpec::default(), &config, None).unwrap();

        let args = json!({"imageName": "alpine"}).as_object().cloned().unwrap();
        let result = DockerPull::create(CreateOperation::new(args)).unwrap().run(&env).await;
        assert!(matches!(result, Err(Error::EnvironmentNotSupported(_))));
    }

    #[test]
    fn test_image_name_required() {
        assert!(DockerPull::create(CreateOperation::default()).is_err());
    }
}
