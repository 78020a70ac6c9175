//! Built-in operations

pub mod console;
pub mod docker;
pub mod download;
pub mod files;
pub mod runtime;

use std::path::Path;
use std::sync::Arc;

use crate::operation::{FnFactory, OperationFactory};

pub use console::{Command, Console, Sleep, Stdin};
pub use docker::DockerPull;
pub use download::{Download, DownloadFactory};
pub use files::{AlterFile, Archive, Extract, Mkdir, MoveFile, WriteFile};
pub use runtime::{RuntimeDownload, RuntimeFactory, RuntimeKind};

/// Every built-in factory. Runtime downloads install into `binaries`.
pub fn builtin_factories(http: reqwest::Client, binaries: &Path) -> Vec<Arc<dyn OperationFactory>> {
    let mut factories: Vec<Arc<dyn OperationFactory>> = vec![
        Arc::new(FnFactory::new("alterfile", AlterFile::create)),
        Arc::new(FnFactory::new("archive", Archive::create)),
        Arc::new(FnFactory::new("command", Command::create)),
        Arc::new(FnFactory::new("console", Console::create)),
        Arc::new(FnFactory::new("dockerpull", DockerPull::create)),
        Arc::new(DownloadFactory::new(http.clone())),
        Arc::new(FnFactory::new("extract", Extract::create)),
        Arc::new(FnFactory::new("mkdir", Mkdir::create)),
        Arc::new(FnFactory::new("move", MoveFile::create)),
        Arc::new(FnFactory::new("sleep", Sleep::create)),
        Arc::new(FnFactory::new("stdin", Stdin::create)),
        Arc::new(FnFactory::new("writefile", WriteFile::create)),
    ];
    for factory in runtime::runtime_factories(http, binaries) {
        factories.push(Arc::new(factory));
    }
    factories
}
