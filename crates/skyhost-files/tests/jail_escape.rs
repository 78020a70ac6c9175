//! Escape attempts against both resolution strategies

use skyhost_core::Error;
use skyhost_files::{compress, FileServer, Resolver};
use std::os::unix::fs::symlink;
use std::path::Path;
use tempfile::TempDir;

struct Fixture {
    tmp: TempDir,
    fs: FileServer,
}

impl Fixture {
    fn new(resolver: Resolver) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), "secret").unwrap();

        symlink(&outside, root.join("abs_dir")).unwrap();
        symlink("../outside", root.join("rel_dir")).unwrap();
        symlink(outside.join("secret.txt"), root.join("abs_file")).unwrap();

        let fs = FileServer::with_options(&root, None, resolver);
        Self { tmp, fs }
    }

    fn outside(&self) -> std::path::PathBuf {
        self.tmp.path().join("outside")
    }

    fn secret_intact(&self) -> bool {
        std::fs::read_to_string(self.outside().join("secret.txt")).unwrap() == "secret"
    }
}

fn resolvers() -> [Resolver; 2] {
    [Resolver::Auto, Resolver::Walk]
}

#[test]
fn test_dot_dot_is_rejected() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        let err = fx.fs.open("../outside/secret.txt").unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot(_)), "{:?}", err);
        assert!(fx.fs.create("a/../../outside/new.txt").is_err());
        assert!(!fx.outside().join("new.txt").exists());
    }
}

#[test]
fn test_absolute_path_stays_inside_root() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        let outside = fx.outside();
        let absolute = outside.join("secret.txt");
        // resolved as root/<absolute path>, which does not exist
        assert!(fx.fs.open(absolute.to_str().unwrap()).is_err());

        fx.fs.write("/inside.txt", b"1").unwrap();
        assert!(fx.tmp.path().join("root/inside.txt").exists());
    }
}

#[test]
fn test_symlinked_directory_is_not_traversed() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        for link in ["abs_dir", "rel_dir"] {
            assert!(fx.fs.open(&format!("{}/secret.txt", link)).is_err());
            assert!(fx.fs.create(&format!("{}/new.txt", link)).is_err());
            assert!(fx.fs.read_dir(link).is_err());
            assert!(fx.fs.mkdir_all(&format!("{}/sub", link)).is_err());
            assert!(fx.fs.rename(&format!("{}/secret.txt", link), "stolen.txt").is_err());
            assert!(fx.fs.remove(&format!("{}/secret.txt", link)).is_err());
        }
        assert!(!fx.outside().join("new.txt").exists());
        assert!(!fx.outside().join("sub").exists());
        assert!(fx.secret_intact());
    }
}

#[test]
fn test_symlinked_file_is_not_followed() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        assert!(fx.fs.open("abs_file").is_err());
        assert!(fx.fs.create("abs_file").is_err());
        assert!(fx.fs.append("abs_file").is_err());
        assert!(fx.secret_intact());

        // the link itself is visible
        assert!(fx.fs.stat("abs_file").unwrap().file_type().is_symlink());
    }
}

#[test]
fn test_remove_all_removes_links_not_targets() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        fx.fs.remove_all("abs_dir").unwrap();
        fx.fs.remove_all("").unwrap();
        assert!(fx.fs.read_dir("").unwrap().is_empty());
        assert!(fx.secret_intact());
        assert!(Path::new(&fx.outside()).is_dir());
    }
}

#[test]
fn test_archive_does_not_follow_links() {
    for resolver in resolvers() {
        let fx = Fixture::new(resolver);
        fx.fs.write("level.dat", b"lvl").unwrap();
        compress(&fx.fs, &["/".to_string()], "backup.tar.gz").unwrap();

        let file = std::fs::File::open(fx.tmp.path().join("root/backup.tar.gz")).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["level.dat"]);
    }
}
