//! File operations, all through the server's jail

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use skyhost_core::{Error, Result};
use skyhost_env::Environment;

use crate::operation::{CreateOperation, Operation, OperationResult};

/// `mkdir{target}`
pub struct Mkdir {
    target: String,
}

impl Mkdir {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            target: op.string("target")?,
        }))
    }
}

#[async_trait]
impl Operation for Mkdir {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Creating directory: {}", self.target));
        env.files().mkdir_all(&self.target)?;
        Ok(OperationResult::default())
    }
}

/// `writefile{target, text}`
pub struct WriteFile {
    target: String,
    text: String,
}

impl WriteFile {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            target: op.string("target")?,
            text: op.optional_string("text").unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl Operation for WriteFile {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Writing data to file: {}", self.target));
        env.files().write(&self.target, self.text.as_bytes())?;
        Ok(OperationResult::default())
    }
}

/// `alterfile{file, search, replace, regex}`
pub struct AlterFile {
    file: String,
    search: String,
    replace: String,
    pattern: Option<Regex>,
}

impl AlterFile {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        let search = op.string("search")?;
        let pattern = if op.flag("regex") {
            Some(
                Regex::new(&search)
                    .map_err(|e| Error::invalid_argument(format!("invalid search pattern: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Box::new(Self {
            file: op.string("file")?,
            replace: op.optional_string("replace").unwrap_or_default(),
            search,
            pattern,
        }))
    }
}

#[async_trait]
impl Operation for AlterFile {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Altering file: {}", self.file));
        let content = env.files().read_to_string(&self.file)?;
        let altered = match &self.pattern {
            Some(pattern) => pattern.replace_all(&content, self.replace.as_str()).into_owned(),
            None => content.replace(&self.search, &self.replace),
        };
        env.files().write(&self.file, altered.as_bytes())?;
        Ok(OperationResult::default())
    }
}

/// `move{source, target}`; a glob source moves every match into `target`
pub struct MoveFile {
    source: String,
    target: String,
}

impl MoveFile {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            source: op.string("source")?,
            target: op.string("target")?,
        }))
    }

    fn is_pattern(&self) -> bool {
        self.source.contains(['*', '?', '['])
    }
}

#[async_trait]
impl Operation for MoveFile {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        let files = env.files();
        if !self.is_pattern() {
            env.display_to_console(&format!("Moving file from {} to {}", self.source, self.target));
            files.rename(&self.source, &self.target)?;
            return Ok(OperationResult::default());
        }

        let matches = files.glob(&self.source)?;
        files.mkdir_all(&self.target)?;
        for source in matches {
            let name = source.rsplit('/').next().unwrap_or(&source);
            let target = skyhost_files::join(&self.target, name);
            debug!(server = %env.id(), from = %source, to = %target, "moving");
            env.display_to_console(&format!("Moving file from {} to {}", source, target));
            files.rename(&source, &target)?;
        }
        Ok(OperationResult::default())
    }
}

/// `archive{source[], destination}`
pub struct Archive {
    sources: Vec<String>,
    destination: String,
}

impl Archive {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            sources: op.strings("source")?,
            destination: op.string("destination")?,
        }))
    }
}

#[async_trait]
impl Operation for Archive {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Compressing {} into {}", self.sources.join(", "), self.destination));
        let files = env.files().clone();
        let sources = self.sources.clone();
        let destination = self.destination.clone();
        tokio::task::spawn_blocking(move || skyhost_files::compress(&files, &sources, &destination))
            .await
            .map_err(|e| Error::OperationFailed(format!("archive task failed: {}", e)))??;
        Ok(OperationResult::default())
    }
}

/// `extract{source, destination}`
pub struct Extract {
    source: String,
    destination: String,
}

impl Extract {
    pub fn create(op: CreateOperation) -> Result<Box<dyn Operation>> {
        Ok(Box::new(Self {
            source: op.string("source")?,
            destination: op.optional_string("destination").unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl Operation for Extract {
    async fn run(&self, env: &Environment) -> Result<OperationResult> {
        env.display_to_console(&format!("Extracting {}", self.source));
        let files = env.files().clone();
        let source = self.source.clone();
        let destination = self.destination.clone();
        tokio::task::spawn_blocking(move || skyhost_files::extract(&files, &source, &destination))
            .await
            .map_err(|e| Error::OperationFailed(format!("extract task failed: {}", e)))??;
        Ok(OperationResult::default())
    }
}
