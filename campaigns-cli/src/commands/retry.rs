//! `campaigns retry <changeset>`

use anyhow::{Context, Result};
use clap::Args;

use campaigns_core::ChangesetId;
use campaigns_daemon::EngineRequest;

use super::{execute, home};

#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Changeset id.
    pub changeset: i64,
}

impl RetryArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        execute(
            &home,
            &EngineRequest::Retry {
                changeset: ChangesetId(self.changeset),
            },
        )
        .with_context(|| format!("failed to retry changeset {}", self.changeset))?;
        println!("✓ Changeset {} re-enqueued", self.changeset);
        Ok(())
    }
}
