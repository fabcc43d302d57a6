//! `campaigns close <campaign>`

use anyhow::{Context, Result};
use clap::Args;

use campaigns_core::CampaignId;
use campaigns_daemon::EngineRequest;

use super::{execute, home};

#[derive(Args, Debug)]
pub struct CloseArgs {
    /// Campaign id.
    pub campaign: i64,

    /// Also close the campaign's open changesets on their code hosts.
    #[arg(long)]
    pub close_changesets: bool,
}

impl CloseArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let campaign = execute(
            &home,
            &EngineRequest::Close {
                campaign: CampaignId(self.campaign),
                close_changesets: self.close_changesets,
            },
        )
        .with_context(|| format!("failed to close campaign {}", self.campaign))?;
        println!(
            "✓ Closed campaign {} ({})",
            self.campaign,
            campaign["name"].as_str().unwrap_or_default()
        );
        if self.close_changesets {
            println!("  open changesets are queued for closing");
        }
        Ok(())
    }
}
