//! Jailed file server
//!
//! Every path is relative to the server root and is resolved against a
//! directory handle opened on that root, never through a host path. With
//! `openat2(RESOLVE_BENEATH)` the kernel rejects any resolution leaving the
//! root; without it each component is opened one at a time relative to the
//! previous one with `O_NOFOLLOW`, so no symlink is ever followed.

use parking_lot::Mutex;
use rustix::fs::{self as rfs, AtFlags, FileType, Mode, OFlags, ResolveFlags};
use rustix::io::Errno;
use std::fs::{File, Metadata};
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use skyhost_core::{Error, Result};

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// How paths are resolved below the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    /// `openat2` when the kernel offers it, the component walk otherwise
    Auto,
    /// Always walk component by component
    Walk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileKind {
    fn from_file_type(file_type: FileType) -> Self {
        match file_type {
            FileType::RegularFile => FileKind::File,
            FileType::Directory => FileKind::Dir,
            FileType::Symlink => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

struct Inner {
    root: PathBuf,
    handle: Mutex<Option<Arc<OwnedFd>>>,
    owner: Option<(u32, u32)>,
    resolver: Resolver,
    openat2_unavailable: AtomicBool,
}

/// File access confined to one server root. Cheap to clone.
#[derive(Clone)]
pub struct FileServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("root", &self.inner.root)
            .field("owner", &self.inner.owner)
            .field("resolver", &self.inner.resolver)
            .finish()
    }
}

/// Normalise a root-relative path into plain components. A leading `/` is
/// the root itself; `..` that would climb above the root is rejected.
pub fn clean_path(path: &str) -> Result<Vec<String>> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::PathOutsideRoot(path.to_string()));
                }
            }
            name => {
                if name.contains('\0') {
                    return Err(Error::invalid_argument(format!("invalid path {:?}", path)));
                }
                parts.push(name.to_string());
            }
        }
    }
    Ok(parts)
}

/// Join a directory and a name into a root-relative path
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

impl FileServer {
    /// Jail rooted at `root`. The directory is opened lazily, so it may not
    /// exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_options(root, None, Resolver::Auto)
    }

    /// `owner` is applied to every created entry; `None` leaves ownership alone
    pub fn with_options(root: impl Into<PathBuf>, owner: Option<(u32, u32)>, resolver: Resolver) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                handle: Mutex::new(None),
                owner,
                resolver,
                openat2_unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Host path of the root
    pub fn prefix(&self) -> &Path {
        &self.inner.root
    }

    pub fn owner(&self) -> Option<(u32, u32)> {
        self.inner.owner
    }

    /// Drop the cached root handle, needed after the root is deleted and recreated
    pub fn invalidate(&self) {
        *self.inner.handle.lock() = None;
    }

    fn root_handle(&self) -> Result<Arc<OwnedFd>> {
        let mut guard = self.inner.handle.lock();
        if let Some(fd) = guard.as_ref() {
            return Ok(fd.clone());
        }
        let fd = rfs::open(
            self.inner.root.as_path(),
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(io_err)?;
        let fd = Arc::new(fd);
        *guard = Some(fd.clone());
        Ok(fd)
    }

    fn open_at(&self, path: &str, flags: OFlags, mode: Mode) -> Result<OwnedFd> {
        let parts = clean_path(path)?;
        let root = self.root_handle()?;

        if parts.is_empty() {
            return rfs::openat(root.as_fd(), ".", flags | OFlags::CLOEXEC, mode)
                .map_err(|e| map_errno(e, path));
        }

        if self.inner.resolver == Resolver::Auto
            && !self.inner.openat2_unavailable.load(Ordering::Relaxed)
        {
            match rfs::openat2(
                root.as_fd(),
                parts.join("/"),
                flags | OFlags::CLOEXEC,
                mode,
                ResolveFlags::BENEATH | ResolveFlags::NO_MAGICLINKS,
            ) {
                Ok(fd) => return Ok(fd),
                Err(e) if e == Errno::NOSYS || e == Errno::PERM => {
                    debug!(root = %self.inner.root.display(), "openat2 unavailable, walking paths");
                    self.inner.openat2_unavailable.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(map_errno(e, path)),
            }
        }

        walk_open(root.as_fd(), &parts, flags, mode, path)
    }

    /// Parent directory handle plus the final name
    fn parent_of(&self, path: &str) -> Result<(OwnedFd, String)> {
        let mut parts = clean_path(path)?;
        let name = parts
            .pop()
            .ok_or_else(|| Error::invalid_argument("operation not permitted on the server root"))?;
        let parent = self.open_at(&parts.join("/"), OFlags::PATH | OFlags::DIRECTORY, Mode::empty())?;
        Ok((parent, name))
    }

    fn apply_owner(&self, file: &File) -> Result<()> {
        if let Some((uid, gid)) = self.inner.owner {
            std::os::unix::fs::fchown(file, Some(uid), Some(gid))?;
        }
        Ok(())
    }

    /// Open for reading
    pub fn open(&self, path: &str) -> Result<File> {
        let fd = self.open_at(path, OFlags::RDONLY, Mode::empty())?;
        Ok(File::from(fd))
    }

    /// Create or truncate for writing
    pub fn create(&self, path: &str) -> Result<File> {
        self.open_write(path, OFlags::TRUNC)
    }

    /// Create or open for appending
    pub fn append(&self, path: &str) -> Result<File> {
        self.open_write(path, OFlags::APPEND)
    }

    fn open_write(&self, path: &str, extra: OFlags) -> Result<File> {
        let fd = self.open_at(
            path,
            OFlags::WRONLY | OFlags::CREATE | extra,
            Mode::from_raw_mode(FILE_MODE),
        )?;
        let file = File::from(fd);
        self.apply_owner(&file)?;
        Ok(file)
    }

    /// Metadata of the entry itself; symlinks are not followed
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let fd = self.open_at(path, OFlags::PATH | OFlags::NOFOLLOW, Mode::empty())?;
        Ok(File::from(fd).metadata()?)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let fd = self.open_at(path, OFlags::RDONLY | OFlags::DIRECTORY, Mode::empty())?;
        let dir = rfs::Dir::read_from(&fd).map_err(io_err)?;

        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let kind = match entry.file_type() {
                FileType::Unknown => {
                    let stat = rfs::statat(&fd, name.as_str(), AtFlags::SYMLINK_NOFOLLOW)
                        .map_err(io_err)?;
                    FileKind::from_file_type(FileType::from_raw_mode(stat.st_mode))
                }
                other => FileKind::from_file_type(other),
            };
            entries.push(DirEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_of(path)?;
        rfs::mkdirat(&parent, name.as_str(), Mode::from_raw_mode(DIR_MODE))
            .map_err(|e| map_errno(e, path))?;
        if self.inner.owner.is_some() {
            let dir = File::from(self.open_at(path, OFlags::RDONLY | OFlags::DIRECTORY, Mode::empty())?);
            self.apply_owner(&dir)?;
        }
        Ok(())
    }

    /// Create a directory and every missing parent
    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        let parts = clean_path(path)?;
        for depth in 1..=parts.len() {
            let prefix = parts[..depth].join("/");
            match self.mkdir(&prefix) {
                Ok(()) => {}
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove a file, a symlink or an empty directory
    pub fn remove(&self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_of(path)?;
        let stat = rfs::statat(&parent, name.as_str(), AtFlags::SYMLINK_NOFOLLOW)
            .map_err(|e| map_errno(e, path))?;
        let flags = if FileType::from_raw_mode(stat.st_mode) == FileType::Directory {
            AtFlags::REMOVEDIR
        } else {
            AtFlags::empty()
        };
        rfs::unlinkat(&parent, name.as_str(), flags).map_err(|e| map_errno(e, path))
    }

    /// Remove recursively. Children are re-resolved through the jail one by
    /// one; a missing path is not an error. The root itself is emptied, not removed.
    pub fn remove_all(&self, path: &str) -> Result<()> {
        let parts = clean_path(path)?;
        if parts.is_empty() {
            return self.clear();
        }
        let rel = parts.join("/");

        let metadata = match self.stat(&rel) {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if metadata.is_dir() {
            for entry in self.read_dir(&rel)? {
                self.remove_all(&join(&rel, &entry.name))?;
            }
        }
        self.remove(&rel)
    }

    /// Remove everything below the root
    pub fn clear(&self) -> Result<()> {
        for entry in self.read_dir("")? {
            self.remove_all(&entry.name)?;
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (from_parent, from_name) = self.parent_of(from)?;
        let (to_parent, to_name) = self.parent_of(to)?;
        rfs::renameat(&from_parent, from_name.as_str(), &to_parent, to_name.as_str())
            .map_err(|e| map_errno(e, from))
    }

    /// Match the last component of `pattern` against the entries of its directory
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let parts = clean_path(pattern)?;
        let Some((last, dir_parts)) = parts.split_last() else {
            return Ok(Vec::new());
        };
        let dir = dir_parts.join("/");
        let matcher = glob::Pattern::new(last).map_err(|e| Error::invalid_argument(e.to_string()))?;

        let entries = match self.read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(entries
            .into_iter()
            .filter(|e| matcher.matches(&e.name))
            .map(|e| join(&dir, &e.name))
            .collect())
    }

    /// Create `link` pointing at the root-relative `target`
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let target_parts = clean_path(target)?;
        let depth = clean_path(link)?.len().saturating_sub(1);
        let (parent, name) = self.parent_of(link)?;

        let mut content = "../".repeat(depth);
        content.push_str(&target_parts.join("/"));
        if content.is_empty() {
            content.push('.');
        }

        rfs::symlinkat(content.as_str(), &parent, name.as_str()).map_err(|e| map_errno(e, link))
    }

    /// Every entry below `path`, parents before children
    pub fn walk(&self, path: &str) -> Result<Vec<(String, FileKind)>> {
        let mut out = Vec::new();
        let rel = clean_path(path)?.join("/");
        self.walk_into(&rel, &mut out)?;
        Ok(out)
    }

    fn walk_into(&self, dir: &str, out: &mut Vec<(String, FileKind)>) -> Result<()> {
        for entry in self.read_dir(dir)? {
            let path = join(dir, &entry.name);
            out.push((path.clone(), entry.kind));
            if entry.kind == FileKind::Dir {
                self.walk_into(&path, out)?;
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut file = self.create(path)?;
        file.write_all(contents)?;
        Ok(())
    }

    pub fn read_to_string(&self, path: &str) -> Result<String> {
        let mut contents = String::new();
        self.open(path)?.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

/// Open `parts` below `root` one component at a time. Intermediate handles
/// are `O_PATH` directories opened with `O_NOFOLLOW` and closed as soon as
/// the next one is open.
fn walk_open(
    root: BorrowedFd<'_>,
    parts: &[String],
    flags: OFlags,
    mode: Mode,
    original: &str,
) -> Result<OwnedFd> {
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| Error::invalid_argument("empty path"))?;

    let mut current: Option<OwnedFd> = None;
    for part in parents {
        let dir = current.as_ref().map(|fd| fd.as_fd()).unwrap_or(root);
        let next = rfs::openat(
            dir,
            part.as_str(),
            OFlags::PATH | OFlags::NOFOLLOW | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| component_error(dir, part, e, original))?;
        current = Some(next);
    }

    let dir = current.as_ref().map(|fd| fd.as_fd()).unwrap_or(root);
    rfs::openat(dir, last.as_str(), flags | OFlags::NOFOLLOW | OFlags::CLOEXEC, mode)
        .map_err(|e| component_error(dir, last, e, original))
}

/// A component that refuses to open because it is a symlink is a jail violation
fn component_error(dir: BorrowedFd<'_>, name: &str, errno: Errno, path: &str) -> Error {
    if errno == Errno::NOTDIR || errno == Errno::LOOP {
        if let Ok(stat) = rfs::statat(dir, name, AtFlags::SYMLINK_NOFOLLOW) {
            if FileType::from_raw_mode(stat.st_mode) == FileType::Symlink {
                return Error::PathOutsideRoot(path.to_string());
            }
        }
    }
    map_errno(errno, path)
}

fn map_errno(errno: Errno, path: &str) -> Error {
    if errno == Errno::XDEV || errno == Errno::LOOP {
        Error::PathOutsideRoot(path.to_string())
    } else {
        io_err(errno)
    }
}

fn io_err(errno: Errno) -> Error {
    Error::IoError(std::io::Error::from(errno))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(resolver: Resolver) -> (TempDir, FileServer) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("root")).unwrap();
        let fs = FileServer::with_options(tmp.path().join("root"), None, resolver);
        (tmp, fs)
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("").unwrap(), Vec::<String>::new());
        assert_eq!(clean_path("/").unwrap(), Vec::<String>::new());
        assert_eq!(clean_path("./a//b/").unwrap(), vec!["a", "b"]);
        assert_eq!(clean_path("/a/../b").unwrap(), vec!["b"]);
        assert!(matches!(clean_path(".."), Err(Error::PathOutsideRoot(_))));
        assert!(matches!(clean_path("a/../../b"), Err(Error::PathOutsideRoot(_))));
    }

    #[test]
    fn test_write_read_roundtrip() {
        for resolver in [Resolver::Auto, Resolver::Walk] {
            let (_tmp, fs) = setup(resolver);
            fs.mkdir_all("data/nested").unwrap();
            fs.write("data/nested/config.txt", b"X").unwrap();
            assert_eq!(fs.read_to_string("data/nested/config.txt").unwrap(), "X");
            assert_eq!(fs.read_to_string("/data/nested/config.txt").unwrap(), "X");
            assert!(fs.stat("data").unwrap().is_dir());
        }
    }

    #[test]
    fn test_mkdir_all_is_idempotent() {
        let (_tmp, fs) = setup(Resolver::Walk);
        fs.mkdir_all("a/b/c").unwrap();
        fs.mkdir_all("a/b/c").unwrap();
        assert!(fs.exists("a/b/c"));
    }

    #[test]
    fn test_read_dir_sorted() {
        let (_tmp, fs) = setup(Resolver::Auto);
        fs.write("b.txt", b"").unwrap();
        fs.mkdir("a").unwrap();
        let entries = fs.read_dir("").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "a".into(), kind: FileKind::Dir },
                DirEntry { name: "b.txt".into(), kind: FileKind::File },
            ]
        );
    }

    #[test]
    fn test_remove_and_remove_all() {
        let (_tmp, fs) = setup(Resolver::Walk);
        fs.mkdir_all("world/region").unwrap();
        fs.write("world/region/r.0.0.mca", b"data").unwrap();
        fs.write("server.jar", b"jar").unwrap();

        fs.remove("server.jar").unwrap();
        assert!(!fs.exists("server.jar"));

        fs.remove_all("world").unwrap();
        assert!(!fs.exists("world"));

        // missing path is fine
        fs.remove_all("world").unwrap();
        assert!(fs.remove("").is_err());
    }

    #[test]
    fn test_rename() {
        let (_tmp, fs) = setup(Resolver::Auto);
        fs.mkdir("old").unwrap();
        fs.write("old/file", b"1").unwrap();
        fs.rename("old/file", "new_file").unwrap();
        assert_eq!(fs.read_to_string("new_file").unwrap(), "1");
        assert!(!fs.exists("old/file"));
    }

    #[test]
    fn test_glob() {
        let (_tmp, fs) = setup(Resolver::Walk);
        fs.mkdir("logs").unwrap();
        fs.write("logs/a.log", b"").unwrap();
        fs.write("logs/b.log", b"").unwrap();
        fs.write("logs/c.txt", b"").unwrap();
        assert_eq!(fs.glob("logs/*.log").unwrap(), vec!["logs/a.log", "logs/b.log"]);
        assert_eq!(fs.glob("*").unwrap(), vec!["logs"]);
        assert!(fs.glob("missing/*").unwrap().is_empty());
    }

    #[test]
    fn test_symlink_inside_root() {
        let (tmp, fs) = setup(Resolver::Auto);
        fs.mkdir_all("a/b").unwrap();
        fs.write("target.txt", b"hello").unwrap();
        fs.symlink("target.txt", "a/b/link").unwrap();

        let content = std::fs::read_link(tmp.path().join("root/a/b/link")).unwrap();
        assert_eq!(content, PathBuf::from("../../target.txt"));
        assert!(fs.stat("a/b/link").unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_walk_lists_parents_first() {
        let (_tmp, fs) = setup(Resolver::Walk);
        fs.mkdir_all("a/b").unwrap();
        fs.write("a/b/f", b"").unwrap();
        let paths: Vec<String> = fs.walk("").unwrap().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/f"]);
    }

    #[test]
    fn test_root_created_after_construction() {
        let tmp = TempDir::new().unwrap();
        let fs = FileServer::new(tmp.path().join("late"));
        assert!(fs.read_dir("").is_err());
        std::fs::create_dir(tmp.path().join("late")).unwrap();
        fs.invalidate();
        fs.write("ok", b"1").unwrap();
        assert!(fs.exists("ok"));
    }
}
