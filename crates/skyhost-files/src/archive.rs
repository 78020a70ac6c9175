//! Archive creation and extraction through the jail
//!
//! Sources are read and entries written via [`FileServer`], so neither side
//! of an archive operation can reach outside the server root. Entries whose
//! names would climb out of the destination are skipped.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use tracing::{debug, warn};

use crate::jail::{clean_path, join, FileKind, FileServer};
use skyhost_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect from a file name
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Ok(ArchiveFormat::Zip)
        } else {
            Err(Error::Archive(format!("unsupported archive format: {}", name)))
        }
    }
}

/// Archive `sources` (root-relative, files or directories) into the
/// root-relative `destination`. The format follows the destination name.
pub fn compress(fs: &FileServer, sources: &[String], destination: &str) -> Result<()> {
    let format = ArchiveFormat::from_name(destination)?;
    let skip = clean_path(destination)?.join("/");
    let file = fs.create(destination)?;
    write_archive(fs, sources, file, format, Some(&skip))
}

/// Extract the root-relative `source` archive into the root-relative `destination` directory
pub fn extract(fs: &FileServer, source: &str, destination: &str) -> Result<()> {
    let format = ArchiveFormat::from_name(source)?;
    let file = fs.open(source)?;
    extract_archive(fs, file, format, destination)
}

/// Write an archive of `sources` to any writer. `skip` excludes one
/// root-relative path, normally the archive being written.
pub fn write_archive<W: Write + Seek>(
    fs: &FileServer,
    sources: &[String],
    writer: W,
    format: ArchiveFormat,
    skip: Option<&str>,
) -> Result<()> {
    let entries = collect_entries(fs, sources, skip)?;
    debug!(entries = entries.len(), ?format, "writing archive");

    match format {
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(writer);
            append_tar(fs, &mut builder, &entries)?;
            builder.into_inner()?.flush()?;
        }
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_tar(fs, &mut builder, &entries)?;
            builder.into_inner()?.finish()?.flush()?;
        }
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipWriter::new(writer);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (path, kind) in &entries {
                match kind {
                    FileKind::Dir => zip.add_directory(path.as_str(), options).map_err(zip_err)?,
                    FileKind::File => {
                        let mut source = fs.open(path)?;
                        let mode = source.metadata()?.mode();
                        zip.start_file(path.as_str(), options.unix_permissions(mode & 0o777))
                            .map_err(zip_err)?;
                        io::copy(&mut source, &mut zip)?;
                    }
                    _ => {}
                }
            }
            zip.finish().map_err(zip_err)?.flush()?;
        }
    }
    Ok(())
}

/// Unpack an archive from any reader into the root-relative `destination`
pub fn extract_archive<R: Read + Seek>(
    fs: &FileServer,
    reader: R,
    format: ArchiveFormat,
    destination: &str,
) -> Result<()> {
    let destination = clean_path(destination)?.join("/");
    if !destination.is_empty() {
        fs.mkdir_all(&destination)?;
    }

    match format {
        ArchiveFormat::Tar => unpack_tar(fs, tar::Archive::new(reader), &destination),
        ArchiveFormat::TarGz => unpack_tar(fs, tar::Archive::new(GzDecoder::new(reader)), &destination),
        ArchiveFormat::Zip => unpack_zip(fs, reader, &destination),
    }
}

fn collect_entries(
    fs: &FileServer,
    sources: &[String],
    skip: Option<&str>,
) -> Result<Vec<(String, FileKind)>> {
    let mut entries = Vec::new();
    for source in sources {
        let rel = clean_path(source)?.join("/");
        if rel.is_empty() {
            entries.extend(fs.walk("")?);
            continue;
        }
        let metadata = fs.stat(&rel)?;
        if metadata.is_dir() {
            entries.push((rel.clone(), FileKind::Dir));
            entries.extend(fs.walk(&rel)?);
        } else if metadata.is_file() {
            entries.push((rel, FileKind::File));
        }
    }
    if let Some(skip) = skip {
        entries.retain(|(path, _)| path != skip);
    }
    Ok(entries)
}

fn append_tar<W: Write>(
    fs: &FileServer,
    builder: &mut tar::Builder<W>,
    entries: &[(String, FileKind)],
) -> Result<()> {
    for (path, kind) in entries {
        match kind {
            FileKind::Dir => {
                let metadata = fs.stat(path)?;
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(metadata.mode() & 0o7777);
                header.set_mtime(metadata.mtime().max(0) as u64);
                builder.append_data(&mut header, format!("{}/", path), io::empty())?;
            }
            FileKind::File => {
                let file = fs.open(path)?;
                let metadata = file.metadata()?;
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(metadata.len());
                header.set_mode(metadata.mode() & 0o7777);
                header.set_mtime(metadata.mtime().max(0) as u64);
                builder.append_data(&mut header, path, file)?;
            }
            FileKind::Symlink | FileKind::Other => {
                debug!(path = %path, "skipping non-regular entry");
            }
        }
    }
    Ok(())
}

/// Destination path of an archive entry, or `None` when it would leave `destination`
fn entry_target(destination: &str, name: &str) -> Option<String> {
    let rel = match clean_path(name) {
        Ok(parts) if !parts.is_empty() => parts.join("/"),
        _ => return None,
    };
    if name.split('/').any(|c| c == "..") {
        return None;
    }
    Some(join(destination, &rel))
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn unpack_tar<R: Read>(fs: &FileServer, mut archive: tar::Archive<R>, destination: &str) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(target) = entry_target(destination, &name) else {
            warn!(entry = %name, "skipping archive entry outside destination");
            continue;
        };

        match entry.header().entry_type() {
            tar::EntryType::Directory => fs.mkdir_all(&target)?,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = parent_of(&target) {
                    fs.mkdir_all(parent)?;
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut out = fs.create(&target)?;
                io::copy(&mut entry, &mut out)?;
                out.set_permissions(std::fs::Permissions::from_mode(mode & 0o777))?;
            }
            other => debug!(entry = %name, ?other, "skipping unsupported tar entry"),
        }
    }
    Ok(())
}

fn unpack_zip<R: Read + Seek>(fs: &FileServer, reader: R, destination: &str) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).map_err(zip_err)?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_err)?;
        let name = file.name().to_string();
        let Some(target) = entry_target(destination, &name) else {
            warn!(entry = %name, "skipping archive entry outside destination");
            continue;
        };

        if file.is_dir() {
            fs.mkdir_all(&target)?;
            continue;
        }
        if let Some(parent) = parent_of(&target) {
            fs.mkdir_all(parent)?;
        }
        let mut out = fs.create(&target)?;
        io::copy(&mut file, &mut out)?;
        if let Some(mode) = file.unix_mode() {
            out.set_permissions(std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Archive(e.to_string())
}
