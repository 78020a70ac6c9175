//! `download{files[]}`: fetch URLs into the server root

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::info;

use skyhost_core::{Error, Result};
use skyhost_env::Environment;

use crate::operation::{CreateOperation, Operation, OperationFactory, OperationResult};

/// Builds downloads sharing one HTTP client
pub struct DownloadFactory {
    client: reqwest::Client,
}

impl DownloadFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl OperationFactory for DownloadFactory {
    fn key(&self) -> &'static str {
        "download"
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>> {
        let files = op
            .strings("files")?
            .iter()
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| Error::invalid_argument(format!("invalid url '{}': {}", raw, e)))?;
                let name = file_name(&url)?;
                Ok((url, name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Download {
            client: self.client.clone(),
            files,
        }))
    }
}

/// Last path segment of the URL; the file is saved under this name
fn file_name(url: &Url) -> Result<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("url '{}' names no file", url)))
}

pub struct Download {
    client: reqwest::Client,
    files: Vec<(Url, String)>,
}

impl Download {
    async fn fetch(&self, env: &Environment, url: &Url, name: &str) -> Result<u64> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(e.to_string()))?;

        let mut file = tokio::fs::File::from_std(env.files().create(name)?);
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Operation for Download {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        for (url, name) in &self.files {
            env.display_to_console(&format!("Downloading file {}", url));
            let bytes = self.fetch(env, url, name).await?;
            info!(server = %env.id(), %url, file = %name, bytes, "download complete");
        }
        Ok(OperationResult::default())
    }
}
