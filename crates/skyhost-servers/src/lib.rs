//! skyhost servers - lifecycle, scheduling and the server service
//!
//! A [`Server`] owns one Environment and one [`Scheduler`]. The
//! [`ServerService`] owns every loaded server plus the start queue and the
//! stats/alert tickers.

pub mod alerts;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod service;

pub use alerts::{Alert, AlertKind, AlertTracker};
pub use queue::StartQueue;
pub use registry::ServerRegistry;
pub use scheduler::{parse_cron, LimitMode, Schedule, Scheduler};
pub use server::{Activity, Item, Server, ServerContext};
pub use service::ServerService;
