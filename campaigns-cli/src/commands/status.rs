//! `campaigns status`: campaigns, their changesets, and derived state.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use campaigns_core::{
    Campaign, CampaignId, Changeset, ChangesetId, CheckState, CoreError, ExternalState,
    PublicationState, ReconcilerState, RepoId, ReviewState, Store,
};

use super::{home, open_store};

/// Arguments for `campaigns status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show this campaign.
    #[arg(long)]
    pub campaign: Option<i64>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct CampaignStatus {
    id: i64,
    name: String,
    closed: bool,
    changesets: Vec<ChangesetStatus>,
}

#[derive(Debug, Serialize)]
struct ChangesetStatus {
    id: i64,
    repository: String,
    title: String,
    external_id: Option<String>,
    publication: PublicationState,
    external_state: Option<ExternalState>,
    review: Option<ReviewState>,
    checks: Option<CheckState>,
    reconciler: ReconcilerState,
    num_failures: u32,
    failure: Option<String>,
}

#[derive(Tabled)]
struct ChangesetRow {
    #[tabled(rename = "id")]
    id: i64,
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "title")]
    title: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "review")]
    review: String,
    #[tabled(rename = "checks")]
    checks: String,
    #[tabled(rename = "reconciler")]
    reconciler: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let store = open_store(&home)?;
        let report = build_report(&store, self.campaign.map(CampaignId))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

fn build_report<S: Store>(store: &S, only: Option<CampaignId>) -> Result<Vec<CampaignStatus>> {
    let (campaigns, changesets, repos) = store
        .transact(|tx| -> Result<_, CoreError> {
            let campaigns = match only {
                Some(id) => vec![tx.get_campaign(id)?],
                None => tx.list_campaigns()?,
            };
            let changesets = tx.list_changesets(&Default::default())?;
            let repos: HashMap<RepoId, String> = tx
                .list_repos()?
                .into_iter()
                .map(|repo| (repo.id, repo.name))
                .collect();
            Ok((campaigns, changesets, repos))
        })
        .context("failed to read store")?;

    let by_id: HashMap<_, &Changeset> = changesets.iter().map(|c| (c.id, c)).collect();
    Ok(campaigns
        .iter()
        .map(|campaign| campaign_status(campaign, &by_id, &repos))
        .collect())
}

fn campaign_status(
    campaign: &Campaign,
    changesets: &HashMap<ChangesetId, &Changeset>,
    repos: &HashMap<RepoId, String>,
) -> CampaignStatus {
    let rows = campaign
        .changeset_ids
        .iter()
        .filter_map(|id| changesets.get(id))
        .map(|changeset| ChangesetStatus {
            id: changeset.id.0,
            repository: repos
                .get(&changeset.repo_id)
                .cloned()
                .unwrap_or_else(|| changeset.repo_id.to_string()),
            title: changeset
                .metadata
                .as_ref()
                .map(|m| m.title().to_string())
                .unwrap_or_default(),
            external_id: changeset.external_id.clone(),
            publication: changeset.publication_state,
            external_state: changeset.external_state,
            review: changeset.external_review_state,
            checks: changeset.external_check_state,
            reconciler: changeset.reconciler_state,
            num_failures: changeset.num_failures,
            failure: changeset.failure_message.clone(),
        })
        .collect();

    CampaignStatus {
        id: campaign.id.0,
        name: campaign.name.clone(),
        closed: campaign.is_closed(),
        changesets: rows,
    }
}

fn print_table(report: &[CampaignStatus]) {
    if report.is_empty() {
        println!("No campaigns.");
        println!("Run: campaigns apply <spec.yaml>");
        return;
    }

    for campaign in report {
        let header = format!("{} (#{})", campaign.name, campaign.id);
        if campaign.closed {
            println!("{} {}", header.bold(), "CLOSED".bright_black());
        } else {
            println!("{}", header.bold());
        }
        if campaign.changesets.is_empty() {
            println!("  no changesets");
            continue;
        }

        let rows = campaign.changesets.iter().map(|c| ChangesetRow {
            id: c.id,
            repository: c.repository.clone(),
            title: c.title.clone(),
            state: state_label(c),
            review: c.review.map_or_else(|| "-".to_string(), |r| r.to_string()),
            checks: c.checks.map_or_else(|| "-".to_string(), |r| r.to_string()),
            reconciler: reconciler_label(c),
        });
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        for failed in campaign.changesets.iter().filter(|c| c.failure.is_some()) {
            println!(
                "  {} changeset {}: {}",
                "✗".red(),
                failed.id,
                failed.failure.as_deref().unwrap_or_default()
            );
        }
    }
}

fn state_label(changeset: &ChangesetStatus) -> String {
    let Some(state) = changeset.external_state else {
        return match changeset.publication {
            PublicationState::Published => "published".to_string(),
            PublicationState::Unpublished => "unpublished".bright_black().to_string(),
        };
    };
    let label = state.to_string();
    match state {
        ExternalState::Open => label.green(),
        ExternalState::Merged => label.magenta(),
        ExternalState::Closed => label.red(),
        ExternalState::Deleted => label.bright_black(),
    }
    .to_string()
}

fn reconciler_label(changeset: &ChangesetStatus) -> String {
    let label = changeset.reconciler.to_string();
    match changeset.reconciler {
        ReconcilerState::Errored => format!("{} ({})", label.red(), changeset.num_failures),
        ReconcilerState::Completed => label.green().to_string(),
        ReconcilerState::Queued | ReconcilerState::Processing => label.yellow().to_string(),
    }
}
