//! skyhost environments - where a server's process actually runs
//!
//! An [`Environment`] wraps one of two backends: a namespace-sandboxed
//! local process or a Docker container. Both share the console buffer,
//! the console/status/stats trackers and the single-process guarantee.

pub mod console;
pub mod container;
pub mod environment;
pub mod isolation;
pub mod jvm;
pub mod process;
pub mod state;
pub mod stdin;
pub mod tracker;
pub mod traits;

pub use console::ConsoleBuffer;
pub use container::{BollardRuntime, ContainerBackend, ContainerRuntime, DockerSettings};
pub use environment::{Backend, Environment};
pub use isolation::{BindMount, IdentityMap, IsolationPolicy};
pub use process::{ProcessBackend, ProcessSettings};
pub use state::EnvState;
pub use stdin::{ConsoleInput, StdinTarget};
pub use tracker::Tracker;
pub use traits::{ExecutionData, Executor, ExitCallback};
