//! File access, archives and backups of a server

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use skyhost_core::{Error, FileDesc, Result};
use skyhost_files::{extract_archive, write_archive, ArchiveFormat, FileKind};

use super::{Activity, Server};

/// What a path inside the server root holds
#[derive(Debug)]
pub enum Item {
    /// Directory listing; non-root directories start with `..`
    Directory(Vec<FileDesc>),
    File {
        name: String,
        size: u64,
        file: std::fs::File,
    },
}

fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(i) if i > 0 => name[i..].to_string(),
        _ => String::new(),
    }
}

/// Backup names are bare file names inside the server's backup directory
fn backup_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::invalid_argument(format!("invalid backup name '{}'", name)));
    }
    Ok(name)
}

impl Server {
    pub fn get_item(&self, path: &str) -> Result<Item> {
        let files = self.env.files();
        let metadata = files.stat(path)?;

        if !metadata.is_dir() {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            return Ok(Item::File {
                name,
                size: metadata.len(),
                file: files.open(path)?,
            });
        }

        let mut listing = Vec::new();
        if !skyhost_files::clean_path(path)?.is_empty() {
            listing.push(FileDesc {
                name: "..".to_string(),
                file: false,
                ..Default::default()
            });
        }
        for entry in files.read_dir(path)? {
            let mut desc = FileDesc {
                file: entry.kind != FileKind::Dir,
                name: entry.name.clone(),
                ..Default::default()
            };
            if entry.kind == FileKind::File {
                let Ok(info) = files.stat(&skyhost_files::join(path, &entry.name)) else {
                    continue;
                };
                desc.size = info.len();
                desc.modified = info.mtime();
                desc.extension = extension(&entry.name);
            }
            listing.push(desc);
        }
        Ok(Item::Directory(listing))
    }

    /// Archive root-relative sources into a new root-relative archive
    pub async fn archive_items(&self, sources: Vec<String>, destination: String) -> Result<()> {
        if self.env.files().exists(&destination) {
            return Err(Error::FileExists(destination));
        }
        let files = self.env.files().clone();
        tokio::task::spawn_blocking(move || skyhost_files::compress(&files, &sources, &destination))
            .await
            .map_err(|e| Error::OperationFailed(format!("archive task failed: {}", e)))?
    }

    pub async fn extract(&self, source: String, destination: String) -> Result<()> {
        let files = self.env.files().clone();
        tokio::task::spawn_blocking(move || skyhost_files::extract(&files, &source, &destination))
            .await
            .map_err(|e| Error::OperationFailed(format!("extract task failed: {}", e)))?
    }

    pub fn is_archiving(&self) -> bool {
        self.activity() == Some(Activity::Archiving)
    }

    fn backup_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.env.backup_dir().join(backup_name(name)?))
    }

    /// Archive the whole root into `<backups_dir>/<id>/<uuid>.tar.gz` and wait for it
    pub async fn backup(&self) -> Result<String> {
        let _archiving = self.claim(Activity::Archiving).await?;
        let name = format!("{}.tar.gz", uuid::Uuid::new_v4());
        self.write_backup(&name).await.map(|()| name)
    }

    /// Start a backup in the background and return its file name
    pub async fn start_backup(self: &Arc<Self>) -> Result<String> {
        let archiving = self.claim(Activity::Archiving).await?;
        let name = format!("{}.tar.gz", uuid::Uuid::new_v4());
        let server = self.clone();
        let file = name.clone();
        tokio::spawn(async move {
            let _ = server.write_backup(&file).await;
            drop(archiving);
        });
        Ok(name)
    }

    async fn write_backup(&self, name: &str) -> Result<()> {
        self.env.display_to_console("Backing up server");
        let path = self.backup_path(name)?;
        let files = self.env.files().clone();

        let result = async {
            tokio::fs::create_dir_all(self.env.backup_dir()).await?;
            tokio::task::spawn_blocking(move || {
                let file = std::fs::File::create(&path)?;
                write_archive(&files, &[String::new()], file, ArchiveFormat::TarGz, None)
            })
            .await
            .map_err(|e| Error::OperationFailed(format!("backup task failed: {}", e)))?
        }
        .await;

        match &result {
            Ok(()) => {
                info!(server = %self.id, backup = %name, "backup complete");
                self.env.display_to_console("Backup complete");
            }
            Err(e) => {
                error!(server = %self.id, backup = %name, error = %e, "backup failed");
                self.env.display_to_console("Backup failed");
            }
        }
        result
    }

    /// Replace the root contents with a backup and wait for it
    pub async fn restore(&self, name: &str) -> Result<()> {
        let path = self.backup_path(name)?;
        tokio::fs::metadata(&path).await?;
        let _archiving = self.claim(Activity::Archiving).await?;
        self.write_restore(path).await
    }

    pub async fn start_restore(self: &Arc<Self>, name: &str) -> Result<()> {
        let path = self.backup_path(name)?;
        tokio::fs::metadata(&path).await?;
        let archiving = self.claim(Activity::Archiving).await?;
        let server = self.clone();
        tokio::spawn(async move {
            let _ = server.write_restore(path).await;
            drop(archiving);
        });
        Ok(())
    }

    async fn write_restore(&self, path: PathBuf) -> Result<()> {
        self.env.display_to_console("Restoring server");
        let files = self.env.files().clone();

        let result = tokio::task::spawn_blocking(move || {
            let format = ArchiveFormat::from_name(&path.to_string_lossy())?;
            let archive = std::fs::File::open(&path)?;
            files.clear()?;
            extract_archive(&files, archive, format, "")
        })
        .await
        .map_err(|e| Error::OperationFailed(format!("restore task failed: {}", e)))
        .and_then(|r| r);

        match &result {
            Ok(()) => self.env.display_to_console("Restore complete"),
            Err(e) => {
                error!(server = %self.id, error = %e, "restore failed");
                self.env
                    .display_to_console(&format!("Failed to restore files: {}", e));
            }
        }
        result
    }

    /// Backup archives of this server, newest first
    pub async fn list_backups(&self) -> Result<Vec<FileDesc>> {
        let mut dir = match tokio::fs::read_dir(self.env.backup_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            backups.push(FileDesc {
                extension: extension(&name),
                name,
                file: true,
                size: metadata.len(),
                modified: metadata.mtime(),
            });
        }
        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(backups)
    }

    pub async fn delete_backup(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.backup_path(name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        assert_eq!(extension("server.jar"), ".jar");
        assert_eq!(extension("world.tar.gz"), ".gz");
        assert_eq!(extension(".env"), "");
        assert_eq!(extension("README"), "");
    }

    #[test]
    fn test_backup_name_rejects_paths() {
        assert!(backup_name("abc.tar.gz").is_ok());
        assert!(backup_name("../abc.tar.gz").is_err());
        assert!(backup_name("..").is_err());
        assert!(backup_name("").is_err());
    }
}
