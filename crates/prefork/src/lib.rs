//! prefork: a worker-pool supervisor and byte-transparent TCP request
//! router.
//!
//! The master keeps a fixed-size pool of long-lived worker processes alive,
//! each hosting a pre-booted application, and proxies incoming TCP
//! connections to the least-loaded idle worker. Workers are supervised over
//! a private control socket, recycled after a configurable number of
//! requests, respawned on crash, and rolling-restarted when watched source
//! files change.

pub mod bridge;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod lifecycle;
pub mod pool;
pub mod supervisor;
pub mod watcher;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::protocol::{LaunchSpec, MasterMessage, WorkerMessage};
pub use config::Config;
pub use lifecycle::Lifecycle;
pub use pool::{Assignment, PoolHandle, PoolSnapshot, SlotState, StatusInfo};
pub use supervisor::{ProcessSpawner, SpawnError, WorkerProc, WorkerSpawner};
pub use watcher::FileSet;
pub use worker::{AppBridge, BootstrapError, ControlSender, run_worker};
