//! skyhost IPC - newline-delimited JSON over a Unix socket
//!
//! The daemon's server lifecycle interface: the CLI sends one [`Request`]
//! per line and reads one [`Response`] per line.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Request, Response};
pub use server::{IpcConnection, IpcServer};
