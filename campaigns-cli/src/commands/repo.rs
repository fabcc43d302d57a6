//! `campaigns repo add` and `campaigns repo list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use campaigns_core::Store;
use campaigns_daemon::EngineRequest;

use super::super::HostArg;
use super::{execute, home, open_store};

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// List registered repositories.
    List,

    /// Register a repository so campaign specs can reference it.
    Add(AddArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Repository name, e.g. "github.com/acme/api".
    pub name: String,

    /// Code host: github | gitlab | bitbucketserver.
    #[arg(long)]
    pub host: HostArg,

    /// Code host connection serving the repository. Defaults to the host name.
    #[arg(long = "service")]
    pub external_service_id: Option<String>,
}

#[derive(Tabled)]
struct RepoRow {
    id: i64,
    name: String,
    host: String,
    service: String,
}

pub fn run(cmd: RepoCommand) -> Result<()> {
    match cmd {
        RepoCommand::List => list(),
        RepoCommand::Add(args) => add(args),
    }
}

fn list() -> Result<()> {
    let home = home()?;
    let store = open_store(&home)?;
    let repos = store
        .transact(|tx| tx.list_repos())
        .context("failed to list repositories")?;

    if repos.is_empty() {
        println!("No repositories registered.");
        println!("Run: campaigns repo add <name> --host github");
        return Ok(());
    }

    let rows = repos.into_iter().map(|repo| RepoRow {
        id: repo.id.0,
        name: repo.name,
        host: repo.host.to_string(),
        service: repo.external_service_id,
    });
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn add(args: AddArgs) -> Result<()> {
    let home = home()?;
    let repo = execute(
        &home,
        &EngineRequest::AddRepo {
            name: args.name.clone(),
            host: args.host.0,
            external_service_id: args.external_service_id,
        },
    )
    .with_context(|| format!("failed to add repository '{}'", args.name))?;
    println!(
        "✓ Registered {} ({}) as repo {}",
        args.name, args.host, repo["id"]
    );
    Ok(())
}
