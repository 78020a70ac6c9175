//! skyhost files - file access confined to a server root
//!
//! [`FileServer`] resolves every path below a root directory handle and
//! refuses anything that would land outside it. [`archive`] builds and
//! unpacks tar, tar.gz and zip archives on top of it.

pub mod archive;
pub mod jail;

pub use archive::{compress, extract, extract_archive, write_archive, ArchiveFormat};
pub use jail::{clean_path, join, DirEntry, FileKind, FileServer, Resolver};
