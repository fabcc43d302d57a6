//! JSON snapshot of a [`MemoryStore`].
//!
//! Writes use the atomic `.tmp` + rename pattern. Id sequences are not
//! stored; they are rebuilt from the highest id in each table on load.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::events::ChangesetEvent;
use crate::store::memory::{MemoryStore, Tables};
use crate::types::{Campaign, CampaignSpec, Changeset, ChangesetSpec, Repo};

/// On-disk payload.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    repos: Vec<Repo>,
    #[serde(default)]
    campaign_specs: Vec<CampaignSpec>,
    #[serde(default)]
    changeset_specs: Vec<ChangesetSpec>,
    #[serde(default)]
    campaigns: Vec<Campaign>,
    #[serde(default)]
    changesets: Vec<Changeset>,
    #[serde(default)]
    changeset_events: Vec<ChangesetEvent>,
}

impl From<&Tables> for Snapshot {
    fn from(tables: &Tables) -> Self {
        Self {
            repos: tables.repos.values().cloned().collect(),
            campaign_specs: tables.campaign_specs.values().cloned().collect(),
            changeset_specs: tables.changeset_specs.values().cloned().collect(),
            campaigns: tables.campaigns.values().cloned().collect(),
            changesets: tables.changesets.values().cloned().collect(),
            changeset_events: tables.events.values().cloned().collect(),
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            repos: snapshot.repos.into_iter().map(|r| (r.id, r)).collect(),
            campaign_specs: snapshot
                .campaign_specs
                .into_iter()
                .map(|s| (s.id, s))
                .collect(),
            changeset_specs: snapshot
                .changeset_specs
                .into_iter()
                .map(|s| (s.id, s))
                .collect(),
            campaigns: snapshot.campaigns.into_iter().map(|c| (c.id, c)).collect(),
            changesets: snapshot.changesets.into_iter().map(|c| (c.id, c)).collect(),
            events: snapshot
                .changeset_events
                .into_iter()
                .map(|e| (e.id, e))
                .collect(),
            ..Tables::default()
        };
        tables.reseed();
        tables
    }
}

impl MemoryStore {
    /// Load the snapshot at `path`, or start empty if it does not exist yet.
    /// The returned store flushes back to `path`.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::from_tables(Tables::default(), Some(path.to_path_buf())));
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        Ok(Self::from_tables(
            Tables::from(snapshot),
            Some(path.to_path_buf()),
        ))
    }

    /// Write committed state to `path` atomically.
    pub fn save_at(&self, path: &Path) -> Result<(), CoreError> {
        let json = {
            let tables = self.tables()?;
            serde_json::to_string_pretty(&Snapshot::from(&*tables))?
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}
