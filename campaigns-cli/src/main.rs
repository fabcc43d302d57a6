//! Campaigns: apply campaign specs and track their changesets across code hosts.
//!
//! # Usage
//!
//! ```text
//! campaigns repo add <name> --host github|gitlab|bitbucketserver [--service <id>]
//! campaigns repo list
//! campaigns apply <spec.yaml>
//! campaigns status [--campaign <id>] [--json]
//! campaigns schedule [--json]
//! campaigns retry <changeset>
//! campaigns close <campaign> [--close-changesets]
//! campaigns sync <changeset>
//! campaigns daemon start|stop|status
//! ```
//!
//! Store-mutating commands go through the daemon when it is running and
//! operate on `~/.campaigns/store.json` directly when it is not.

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use campaigns_core::HostKind;
use commands::{
    apply::ApplyArgs, close::CloseArgs, daemon::DaemonCommand, repo::RepoCommand,
    retry::RetryArgs, schedule::ScheduleArgs, status::StatusArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "campaigns",
    version,
    about = "Apply campaign specs and reconcile their changesets on code hosts",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and list repositories.
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Store a campaign spec file and apply it.
    Apply(ApplyArgs),

    /// Show changesets and their derived state.
    Status(StatusArgs),

    /// Show when each published changeset will next be synced.
    Schedule(ScheduleArgs),

    /// Re-enqueue a changeset that exhausted its retries.
    Retry(RetryArgs),

    /// Close a campaign.
    Close(CloseArgs),

    /// Ask the running daemon to sync a changeset now.
    Sync(SyncArgs),

    /// Run or query the engine daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared HostKind argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `HostKind` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct HostArg(pub HostKind);

impl FromStr for HostArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self(HostKind::GitHub)),
            "gitlab" => Ok(Self(HostKind::GitLab)),
            "bitbucketserver" | "bitbucket" => Ok(Self(HostKind::BitbucketServer)),
            other => Err(format!(
                "unknown code host '{other}'; expected: github, gitlab, bitbucketserver"
            )),
        }
    }
}

impl fmt::Display for HostArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Repo { command } => commands::repo::run(command),
        Commands::Apply(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Schedule(args) => args.run(),
        Commands::Retry(args) => args.run(),
        Commands::Close(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
