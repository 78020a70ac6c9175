//! `javadl{version}` and `nodejsdl{version}`: shared language runtimes
//!
//! Runtimes are unpacked into the binaries dir, which every server sees,
//! and exposed through versioned command links at its top level (`java21`,
//! `node20`, `npm20`). A runtime whose links already exist is not fetched
//! again. Downloads are serialised per runtime kind.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use skyhost_core::{Error, Result};
use skyhost_env::Environment;
use skyhost_files::{extract_archive, join, ArchiveFormat, FileKind, FileServer};

use crate::operation::{CreateOperation, Operation, OperationFactory, OperationResult};

const ADOPTIUM_URL: &str = "https://api.adoptium.net/v3/binary/latest";
const NODE_INDEX_URL: &str = "https://nodejs.org/dist/index.json";
const NODE_DIST_URL: &str = "https://nodejs.org/dist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Java,
    Node,
}

impl RuntimeKind {
    fn key(self) -> &'static str {
        match self {
            RuntimeKind::Java => "javadl",
            RuntimeKind::Node => "nodejsdl",
        }
    }
}

/// Builds runtime downloads that share one client, one binaries dir and
/// one download lock
pub struct RuntimeFactory {
    kind: RuntimeKind,
    client: reqwest::Client,
    binaries: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl RuntimeFactory {
    pub fn new(kind: RuntimeKind, client: reqwest::Client, binaries: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            client,
            binaries: binaries.into(),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl OperationFactory for RuntimeFactory {
    fn key(&self) -> &'static str {
        self.kind.key()
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>> {
        let version = match self.kind {
            RuntimeKind::Java => java_version(&op)?,
            RuntimeKind::Node => node_version(&op)?,
        };
        Ok(Box::new(RuntimeDownload {
            kind: self.kind,
            version,
            client: self.client.clone(),
            binaries: self.binaries.clone(),
            lock: self.lock.clone(),
        }))
    }
}

/// Java major version; a number or a numeric string
fn java_version(op: &CreateOperation) -> Result<String> {
    let parsed = match op.args.get("version") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| *v > 0)
        .map(|v| v.to_string())
        .ok_or_else(|| Error::invalid_argument("javadl needs a numeric 'version'"))
}

/// Node version prefix such as `20` or `20.11`
fn node_version(op: &CreateOperation) -> Result<String> {
    let version = match op.args.get("version") {
        Some(Value::Number(n)) => n.to_string(),
        _ => op.string("version")?,
    };
    let version = version.trim().trim_start_matches('v').to_string();
    let valid = !version.is_empty()
        && version.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    if !valid {
        return Err(Error::invalid_argument(format!("invalid node version '{}'", version)));
    }
    Ok(version)
}

fn adoptium_arch(arch: &str) -> &'static str {
    match arch {
        "aarch64" => "aarch64",
        "arm" => "arm",
        _ => "x64",
    }
}

fn node_arch(arch: &str) -> &'static str {
    match arch {
        "aarch64" => "arm64",
        "arm" => "armv7l",
        _ => "x64",
    }
}

fn java_url(version: &str, arch: &str) -> String {
    format!(
        "{}/{}/ga/linux/{}/jdk/hotspot/normal/eclipse",
        ADOPTIUM_URL,
        version,
        adoptium_arch(arch)
    )
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .trim_start_matches('v')
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Newest release in the index whose version is `wanted` or starts with
/// `wanted.`; `20` matches `20.11.1` but not `2.0.0` or `200.1.0`
fn best_node_release(index: &[Value], wanted: &str) -> Option<String> {
    let prefix = format!("{}.", wanted);
    index
        .iter()
        .filter_map(|release| release.get("version").and_then(Value::as_str))
        .map(|version| version.trim_start_matches('v'))
        .filter(|version| *version == wanted || version.starts_with(&prefix))
        .max_by_key(|version| numeric_parts(version))
        .map(str::to_string)
}

pub struct RuntimeDownload {
    kind: RuntimeKind,
    version: String,
    client: reqwest::Client,
    binaries: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl RuntimeDownload {
    /// Command links this runtime provides, with their target below the install dir
    fn links(&self) -> Vec<(String, &'static str)> {
        match self.kind {
            RuntimeKind::Java => vec![(format!("java{}", self.version), "bin/java")],
            RuntimeKind::Node => vec![
                (format!("node{}", self.version), "bin/node"),
                (format!("npm{}", self.version), "bin/npm"),
            ],
        }
    }

    async fn resolve_url(&self) -> Result<String> {
        let arch = std::env::consts::ARCH;
        match self.kind {
            RuntimeKind::Java => Ok(java_url(&self.version, arch)),
            RuntimeKind::Node => {
                debug!(url = NODE_INDEX_URL, "fetching node release index");
                let index: Vec<Value> = self
                    .client
                    .get(NODE_INDEX_URL)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::Download(e.to_string()))?
                    .json()
                    .await
                    .map_err(|e| Error::Download(format!("invalid node release index: {}", e)))?;
                let release = best_node_release(&index, &self.version).ok_or_else(|| {
                    Error::Download(format!("no node release matches '{}'", self.version))
                })?;
                Ok(format!(
                    "{}/v{release}/node-v{release}-linux-{}.tar.gz",
                    NODE_DIST_URL,
                    node_arch(arch)
                ))
            }
        }
    }

    /// Stream the archive into a scratch file in the binaries dir
    async fn fetch(&self, fs: &FileServer, url: &str, scratch: &str) -> Result<std::fs::File> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(e.to_string()))?;

        let mut file = tokio::fs::File::from_std(fs.create(scratch)?);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        fs.open(scratch)
    }

    async fn install(&self, fs: &FileServer) -> Result<()> {
        let url = self.resolve_url().await?;
        let install_dir = format!("{}{}-runtime", self.kind_name(), self.version);
        let scratch = format!(".{}.download", install_dir);

        info!(%url, runtime = %install_dir, "downloading runtime");
        let archive = self.fetch(fs, &url, &scratch).await?;

        let unpacked = {
            let fs = fs.clone();
            let install_dir = install_dir.clone();
            tokio::task::spawn_blocking(move || {
                fs.remove_all(&install_dir)?;
                extract_archive(&fs, archive, ArchiveFormat::TarGz, &install_dir)?;
                single_top_dir(&fs, &install_dir)
            })
            .await
            .map_err(|e| Error::OperationFailed(format!("runtime extract task failed: {}", e)))?
        };
        let _ = fs.remove(&scratch);
        let home = unpacked?;

        for (link, target) in self.links() {
            let _ = fs.remove(&link);
            fs.symlink(&format!("{}/{}", home, target), &link)?;
            debug!(link = %link, "runtime command linked");
        }
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            RuntimeKind::Java => "java",
            RuntimeKind::Node => "node",
        }
    }
}

/// Runtime archives hold one top-level directory; the runtime home is that
/// directory, or the install dir itself when the archive is flat
fn single_top_dir(fs: &FileServer, install_dir: &str) -> Result<String> {
    let entries = fs.read_dir(install_dir)?;
    match entries.as_slice() {
        [only] if matches!(only.kind, FileKind::Dir) => Ok(join(install_dir, &only.name)),
        _ => Ok(install_dir.to_string()),
    }
}

#[async_trait]
impl Operation for RuntimeDownload {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        let name = format!("{} {}", self.kind_name(), self.version);
        env.display_to_console(&format!("Downloading {}", name));

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.binaries).await?;
        let fs = FileServer::new(self.binaries.as_path());
        if self.links().iter().all(|(link, _)| fs.exists(link)) {
            debug!(server = %env.id(), runtime = %name, "runtime already present");
            return Ok(OperationResult::default());
        }

        if let Err(e) = self.install(&fs).await {
            env.display_to_console(&format!("Failed to download {}", name));
            return Err(e);
        }
        info!(server = %env.id(), runtime = %name, "runtime installed");
        Ok(OperationResult::default())
    }
}

/// One factory per runtime kind, all installing into `binaries`
pub fn runtime_factories(client: reqwest::Client, binaries: &Path) -> Vec<RuntimeFactory> {
    vec![
        RuntimeFactory::new(RuntimeKind::Java, client.clone(), binaries),
        RuntimeFactory::new(RuntimeKind::Node, client, binaries),
    ]
}
