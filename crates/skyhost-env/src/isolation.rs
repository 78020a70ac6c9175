//! Filesystem isolation policy for sandboxed processes
//!
//! A policy is an allow-list of bind mounts plus an identity mapping. It is
//! prepared in the daemon (scratch root and mount points created, paths
//! resolved) and entered in the forked child right before `exec`:
//!
//! 1. new user, mount, IPC and UTS namespaces
//! 2. sandbox root mapped to the invoking host uid/gid
//! 3. tmpfs on `/tmp`, then every allowed path bind-mounted into the
//!    scratch root (mount points under `/tmp` are made on the tmpfs)
//! 4. `pivot_root` into the scratch root and the old root detached

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, getgid, getuid, pivot_root};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use skyhost_core::Result;

/// Host paths making up the minimal OS surface inside the sandbox
const SYSTEM_PATHS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr",
    "/lib",
    "/lib32",
    "/lib64",
    "/dev",
    "/proc",
    "/etc/alternatives",
    "/etc/ssl",
    "/etc/ca-certificates",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/passwd",
    "/etc/group",
    "/etc/nsswitch.conf",
    "/etc/ld.so.cache",
    "/etc/localtime",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    /// Absolute path inside the sandbox
    pub target: PathBuf,
}

impl BindMount {
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
        }
    }

    /// `source` or `source:target`
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((source, target)) if !target.is_empty() => Self {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
            },
            _ => Self::same_path(spec.trim_end_matches(':')),
        }
    }
}

/// Sandbox root maps to this host identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMap {
    pub uid: u32,
    pub gid: u32,
}

impl IdentityMap {
    pub fn current() -> Self {
        Self {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolationPolicy {
    pub mounts: Vec<BindMount>,
    pub identity: IdentityMap,
    pub working_directory: PathBuf,
}

impl IsolationPolicy {
    /// System surface plus the server's own paths; missing sources are left out
    pub fn new(shared: &[PathBuf], extra: &[String], working_directory: &Path) -> Self {
        let mut mounts: Vec<BindMount> = SYSTEM_PATHS.iter().map(|p| BindMount::same_path(*p)).collect();
        mounts.extend(shared.iter().cloned().map(BindMount::same_path));
        mounts.extend(extra.iter().map(|spec| BindMount::parse(spec)));
        mounts.retain(|m| m.source.exists() && m.target.is_absolute());

        Self {
            mounts,
            identity: IdentityMap::current(),
            working_directory: working_directory.to_path_buf(),
        }
    }

    /// Create the scratch root (under `parent`, or the system temp dir)
    /// and the mount points outside `/tmp`. The returned handle must
    /// outlive the process; dropping it removes the scratch directory.
    pub fn prepare(&self, parent: Option<&Path>) -> Result<PreparedIsolation> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("skyhost-sandbox-");
        let scratch = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let base = scratch.path().to_path_buf();
        let tmp = base.join("tmp");
        std::fs::create_dir_all(&tmp)?;

        let mut binds = Vec::with_capacity(self.mounts.len());
        for bind in &self.mounts {
            let target = inside(&base, &bind.target);
            let is_dir = bind.source.is_dir();
            let dir = if is_dir { target.as_path() } else { target.parent().unwrap_or(&base) };

            // The tmpfs hides anything made here below /tmp; the child makes those
            let make_dirs: Vec<PathBuf> = match dir.strip_prefix(&tmp) {
                Ok(relative) => relative
                    .components()
                    .scan(tmp.clone(), |path, part| {
                        path.push(part);
                        Some(path.clone())
                    })
                    .collect(),
                Err(_) => {
                    std::fs::create_dir_all(dir)?;
                    if !is_dir {
                        std::fs::File::create(&target)?;
                    }
                    Vec::new()
                }
            };
            let make_file = !is_dir && target.starts_with(&tmp);
            binds.push(PlannedBind {
                source: bind.source.clone(),
                target,
                make_dirs,
                make_file,
            });
        }

        let plan = MountPlan {
            scratch: base,
            binds,
            tmp,
            working_directory: self.working_directory.clone(),
            uid_map: format!("0 {} 1\n", self.identity.uid).into_bytes(),
            gid_map: format!("0 {} 1\n", self.identity.gid).into_bytes(),
        };

        Ok(PreparedIsolation {
            scratch,
            plan: Arc::new(plan),
        })
    }
}

fn inside(base: &Path, target: &Path) -> PathBuf {
    base.join(target.strip_prefix("/").unwrap_or(target))
}

/// Scratch directory plus the precomputed mount plan
pub struct PreparedIsolation {
    scratch: TempDir,
    plan: Arc<MountPlan>,
}

impl PreparedIsolation {
    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    pub(crate) fn plan(&self) -> Arc<MountPlan> {
        self.plan.clone()
    }
}

#[derive(Debug)]
struct PlannedBind {
    source: PathBuf,
    target: PathBuf,
    /// Mount point directories to create inside the tmpfs, outermost first
    make_dirs: Vec<PathBuf>,
    make_file: bool,
}

/// Everything the child needs, computed before fork
#[derive(Debug)]
pub(crate) struct MountPlan {
    scratch: PathBuf,
    binds: Vec<PlannedBind>,
    tmp: PathBuf,
    working_directory: PathBuf,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl MountPlan {
    /// Runs in the forked child. Only syscalls on precomputed data.
    pub(crate) fn enter(&self) -> io::Result<()> {
        unshare(
            CloneFlags::CLONE_NEWUSER
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS,
        )?;

        write_proc("/proc/self/setgroups", b"deny")?;
        write_proc("/proc/self/uid_map", &self.uid_map)?;
        write_proc("/proc/self/gid_map", &self.gid_map)?;

        mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)?;
        mount(
            Some(self.scratch.as_path()),
            self.scratch.as_path(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;

        mount(
            Some("tmpfs"),
            self.tmp.as_path(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )?;

        for bind in &self.binds {
            for dir in &bind.make_dirs {
                match rustix::fs::mkdir(dir.as_path(), rustix::fs::Mode::from_raw_mode(0o755)) {
                    Ok(()) | Err(rustix::io::Errno::EXIST) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if bind.make_file {
                rustix::fs::open(
                    bind.target.as_path(),
                    rustix::fs::OFlags::CREATE | rustix::fs::OFlags::WRONLY | rustix::fs::OFlags::CLOEXEC,
                    rustix::fs::Mode::from_raw_mode(0o644),
                )?;
            }
            mount(
                Some(bind.source.as_path()),
                bind.target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )?;
        }

        chdir(self.scratch.as_path())?;
        pivot_root(".", ".")?;
        umount2(".", MntFlags::MNT_DETACH)?;
        chdir(self.working_directory.as_path())?;
        Ok(())
    }
}

fn write_proc(path: &str, contents: &[u8]) -> io::Result<()> {
    let fd = rustix::fs::open(path, rustix::fs::OFlags::WRONLY | rustix::fs::OFlags::CLOEXEC, rustix::fs::Mode::empty())?;
    rustix::io::write(&fd, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        assert_eq!(BindMount::parse("/opt/java"), BindMount::same_path("/opt/java"));
        assert_eq!(
            BindMount::parse("/srv/maps:/maps"),
            BindMount {
                source: "/srv/maps".into(),
                target: "/maps".into()
            }
        );
    }

    #[test]
    fn test_policy_keeps_existing_sources_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("server");
        std::fs::create_dir(&root).unwrap();

        let policy = IsolationPolicy::new(
            &[root.clone(), tmp.path().join("missing")],
            &["relative".to_string()],
            &root,
        );
        assert!(policy.mounts.iter().any(|m| m.source == root));
        assert!(!policy.mounts.iter().any(|m| m.source.ends_with("missing")));
        assert!(policy.mounts.iter().all(|m| m.target.is_absolute()));
    }

    #[test]
    fn test_prepare_creates_mount_points() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("server");
        std::fs::create_dir(&root).unwrap();
        let file = tmp.path().join("motd.txt");
        std::fs::write(&file, "hi").unwrap();

        let policy = IsolationPolicy {
            mounts: vec![BindMount::same_path(&root), BindMount::same_path(&file)],
            identity: IdentityMap { uid: 1000, gid: 1000 },
            working_directory: root.clone(),
        };
        let prepared = policy.prepare(None).unwrap();
        let scratch = prepared.scratch().to_path_buf();

        assert!(scratch.join("tmp").is_dir());
        for bind in &prepared.plan().binds {
            if bind.target.starts_with(scratch.join("tmp")) {
                assert!(!bind.make_dirs.is_empty() || bind.make_file);
            } else {
                assert!(bind.target.exists());
            }
        }
        assert_eq!(prepared.plan().uid_map, b"0 1000 1\n");

        drop(prepared);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_tmp_mount_points_are_made_after_tmpfs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("maps");
        std::fs::create_dir(&source).unwrap();
        let file = tmp.path().join("motd.txt");
        std::fs::write(&file, "hi").unwrap();

        let policy = IsolationPolicy {
            mounts: vec![
                BindMount {
                    source: source.clone(),
                    target: "/tmp/game/maps".into(),
                },
                BindMount {
                    source: file,
                    target: "/tmp/motd.txt".into(),
                },
                BindMount::same_path(&source),
            ],
            identity: IdentityMap { uid: 1000, gid: 1000 },
            working_directory: "/tmp/game/maps".into(),
        };
        let parent = tmp.path().join("sandboxes");
        let prepared = policy.prepare(Some(&parent)).unwrap();
        let scratch = prepared.scratch().to_path_buf();
        assert!(scratch.starts_with(&parent));
        let plan = prepared.plan();

        assert!(!scratch.join("tmp/game").exists());
        assert_eq!(
            plan.binds[0].make_dirs,
            vec![scratch.join("tmp/game"), scratch.join("tmp/game/maps")]
        );
        assert!(!plan.binds[0].make_file);

        assert!(plan.binds[1].make_dirs.is_empty());
        assert!(plan.binds[1].make_file);
        assert!(!scratch.join("tmp/motd.txt").exists());

        // Outside /tmp, unless the host temp dir itself lives there
        if !source.starts_with("/tmp") {
            assert!(inside(&scratch, &source).is_dir());
            assert!(plan.binds[2].make_dirs.is_empty());
        }
    }
}
