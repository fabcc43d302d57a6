//! `campaigns apply <spec.yaml>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use campaigns_core::CampaignSpecFile;
use campaigns_daemon::EngineRequest;

use super::{execute, home};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Campaign spec YAML file.
    pub file: PathBuf,

    /// Print the apply outcome as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ApplyArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let spec = CampaignSpecFile::load_at(&self.file)
            .with_context(|| format!("failed to load {}", self.file.display()))?;
        let name = spec.name.clone();
        let outcome = execute(&home, &EngineRequest::Apply { spec })
            .with_context(|| format!("failed to apply campaign '{name}'"))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("failed to render apply JSON")?
            );
            return Ok(());
        }

        let campaign = &outcome["campaign"];
        if outcome["kind"] == "unchanged" {
            println!("✓ Campaign '{name}' is already at this spec");
            return Ok(());
        }
        let ops = outcome["ops"].as_array().cloned().unwrap_or_default();
        println!(
            "✓ Applied campaign '{name}' (id {}, {} changesets)",
            campaign["id"],
            campaign["changeset_ids"].as_array().map_or(0, Vec::len)
        );
        for op in &ops {
            println!("  {:<14} {}", op_name(op), op_target(op));
        }
        Ok(())
    }
}

fn op_name(op: &Value) -> &str {
    op["operation"].as_str().unwrap_or("?")
}

fn op_target(op: &Value) -> String {
    match (&op["changeset_id"], &op["spec_id"]) {
        (Value::Null, Value::Null) => String::new(),
        (Value::Null, spec) => format!("spec {spec}"),
        (changeset, Value::Null) => format!("changeset {changeset}"),
        (changeset, spec) => format!("changeset {changeset} ← spec {spec}"),
    }
}
