//! `campaigns sync <changeset>`: priority sync through the running daemon.

use anyhow::{Context, Result};
use clap::Args;

use campaigns_core::ChangesetId;
use campaigns_daemon::{request_sync, DaemonError};

use super::home;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Changeset id.
    pub changeset: i64,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        match request_sync(&home, ChangesetId(self.changeset)) {
            Ok(data) if data["queued"] == true => {
                println!("✓ Changeset {} queued for sync", self.changeset);
            }
            Ok(_) => println!("sync queue is full, try again shortly"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                anyhow::bail!("daemon is not running; start it with `campaigns daemon start`")
            }
            Err(err) => return Err(err).context("failed to request sync"),
        }
        Ok(())
    }
}
