//! Campaigns engine daemon: reconciler workers, the sync scheduler, and a
//! newline-delimited JSON socket for the CLI.

pub mod config;
pub mod engine;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;
mod worker;

pub use config::{EngineConfig, LogFormat};
pub use engine::{Engine, NoGitService, StoreSummary};
pub use error::DaemonError;
pub use protocol::{
    request, request_status, request_stop, request_sync, send_request, EngineRequest,
    EngineResponse,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use scheduler::{SchedulerConfig, SyncBackend, SyncScheduler};
pub use worker::WorkerStats;
