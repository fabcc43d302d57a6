pub mod apply;
pub mod close;
pub mod daemon;
pub mod repo;
pub mod retry;
pub mod schedule;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use campaigns_core::MemoryStore;
use campaigns_daemon::paths::store_path;
use campaigns_daemon::{request, DaemonError, Engine, EngineConfig, EngineRequest};

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Run a store-mutating request on the daemon, or locally when no daemon
/// is listening.
pub fn execute(home: &Path, req: &EngineRequest) -> Result<Value> {
    match request(home, req) {
        Ok(data) => Ok(data),
        Err(DaemonError::DaemonNotRunning { .. }) => {
            let config = EngineConfig::load_at(home).context("failed to load engine config")?;
            let engine = Engine::open_at(home, &config).context("failed to open store")?;
            Ok(engine.execute(req, Utc::now())?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Read-only view of the last flushed store state.
pub fn open_store(home: &Path) -> Result<MemoryStore> {
    let path = store_path(home);
    MemoryStore::load_at(&path).with_context(|| format!("failed to read {}", path.display()))
}
