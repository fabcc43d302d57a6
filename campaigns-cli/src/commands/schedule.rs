//! `campaigns schedule`: when each published changeset is next synced.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use campaigns_core::Store;
use campaigns_reconciler::build_schedule;

use super::{home, open_store};

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "changeset")]
    changeset: i64,
    #[tabled(rename = "repo")]
    repo: i64,
    #[tabled(rename = "next sync")]
    next_sync: String,
    #[tabled(rename = "in")]
    due_in: String,
}

impl ScheduleArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let store = open_store(&home)?;
        let data = store
            .transact(|tx| tx.list_changeset_sync_data())
            .context("failed to load sync data")?;
        let now = Utc::now();
        let schedule = build_schedule(now, &data);

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&schedule)
                    .context("failed to serialize schedule JSON")?
            );
            return Ok(());
        }

        if schedule.is_empty() {
            println!("No published changesets to sync.");
            return Ok(());
        }
        let rows = schedule.iter().map(|entry| ScheduleRow {
            changeset: entry.changeset_id.0,
            repo: entry.repo_id.0,
            next_sync: entry.next_sync.to_rfc3339(),
            due_in: format_delay((entry.next_sync - now).num_seconds()),
        });
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn format_delay(seconds: i64) -> String {
    match seconds {
        s if s <= 0 => "due".to_string(),
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::format_delay;

    #[test]
    fn delays_are_humanized() {
        assert_eq!(format_delay(-5), "due");
        assert_eq!(format_delay(42), "42s");
        assert_eq!(format_delay(600), "10m");
        assert_eq!(format_delay(8 * 3600 + 90), "8h01m");
    }
}
