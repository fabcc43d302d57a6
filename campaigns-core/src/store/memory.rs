//! In-process [`Store`] implementation.
//!
//! Tables live behind one mutex. A transaction clones them, runs against the
//! copy, and swaps the copy in on success, so a failed transaction leaves no
//! trace. Lock order is always tables → row locks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::events::ChangesetEvent;
use crate::store::locks::{RowLockGuard, RowLocks};
use crate::store::{
    ChangesetSyncData, ListChangesetsOpts, Store, StoreTx, CANCELED_FAILURE_MESSAGE,
};
use crate::types::{
    Campaign, CampaignId, CampaignSpec, CampaignSpecId, Changeset, ChangesetEventId, ChangesetId,
    ChangesetSpec, ChangesetSpecId, ExternalState, Namespace, ReconcilerState, Repo, RepoId,
};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Sequences {
    pub repo: i64,
    pub campaign_spec: i64,
    pub changeset_spec: i64,
    pub campaign: i64,
    pub changeset: i64,
    pub event: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub repos: BTreeMap<RepoId, Repo>,
    pub campaign_specs: BTreeMap<CampaignSpecId, CampaignSpec>,
    pub changeset_specs: BTreeMap<ChangesetSpecId, ChangesetSpec>,
    pub campaigns: BTreeMap<CampaignId, Campaign>,
    pub changesets: BTreeMap<ChangesetId, Changeset>,
    pub events: BTreeMap<ChangesetEventId, ChangesetEvent>,
    pub seq: Sequences,
}

impl Tables {
    /// Rebuild id sequences from the highest ids present.
    pub(crate) fn reseed(&mut self) {
        fn max_key<K: Copy, V>(map: &BTreeMap<K, V>, id: impl Fn(K) -> i64) -> i64 {
            map.keys().next_back().map_or(0, |k| id(*k))
        }
        self.seq = Sequences {
            repo: max_key(&self.repos, |k| k.0),
            campaign_spec: max_key(&self.campaign_specs, |k| k.0),
            changeset_spec: max_key(&self.changeset_specs, |k| k.0),
            campaign: max_key(&self.campaigns, |k| k.0),
            changeset: max_key(&self.changesets, |k| k.0),
            event: max_key(&self.events, |k| k.0),
        };
    }

    fn is_ready(changeset: &Changeset, now: DateTime<Utc>, max_retries: u32) -> bool {
        let state_ok = match changeset.reconciler_state {
            ReconcilerState::Queued => true,
            ReconcilerState::Errored => changeset.num_failures < max_retries,
            ReconcilerState::Processing | ReconcilerState::Completed => false,
        };
        state_ok && changeset.process_after.map_or(true, |after| after <= now)
    }
}

impl StoreTx for Tables {
    fn create_repo(&mut self, repo: &mut Repo) -> Result<(), CoreError> {
        if self.repos.values().any(|r| r.name == repo.name) {
            return Err(CoreError::InvalidInput(format!(
                "repository {} already exists",
                repo.name
            )));
        }
        repo.id = RepoId(next(&mut self.seq.repo));
        self.repos.insert(repo.id, repo.clone());
        Ok(())
    }

    fn get_repo(&self, id: RepoId) -> Result<Repo, CoreError> {
        self.repos
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("repository", id))
    }

    fn find_repo_by_name(&self, name: &str) -> Result<Option<Repo>, CoreError> {
        Ok(self.repos.values().find(|r| r.name == name).cloned())
    }

    fn list_repos(&self) -> Result<Vec<Repo>, CoreError> {
        Ok(self.repos.values().cloned().collect())
    }

    fn create_campaign_spec(&mut self, spec: &mut CampaignSpec) -> Result<(), CoreError> {
        spec.id = CampaignSpecId(next(&mut self.seq.campaign_spec));
        self.campaign_specs.insert(spec.id, spec.clone());
        Ok(())
    }

    fn get_campaign_spec(&self, id: CampaignSpecId) -> Result<CampaignSpec, CoreError> {
        self.campaign_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("campaign spec", id))
    }

    fn create_changeset_spec(&mut self, spec: &mut ChangesetSpec) -> Result<(), CoreError> {
        if !self.campaign_specs.contains_key(&spec.campaign_spec_id) {
            return Err(CoreError::not_found("campaign spec", spec.campaign_spec_id));
        }
        spec.id = ChangesetSpecId(next(&mut self.seq.changeset_spec));
        self.changeset_specs.insert(spec.id, spec.clone());
        Ok(())
    }

    fn get_changeset_spec(&self, id: ChangesetSpecId) -> Result<ChangesetSpec, CoreError> {
        self.changeset_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("changeset spec", id))
    }

    fn list_changeset_specs(
        &self,
        campaign_spec_id: CampaignSpecId,
    ) -> Result<Vec<ChangesetSpec>, CoreError> {
        Ok(self
            .changeset_specs
            .values()
            .filter(|s| s.campaign_spec_id == campaign_spec_id)
            .cloned()
            .collect())
    }

    fn create_campaign(&mut self, campaign: &mut Campaign) -> Result<(), CoreError> {
        if self
            .campaigns
            .values()
            .any(|c| c.namespace == campaign.namespace && c.name == campaign.name)
        {
            return Err(CoreError::InvalidInput(format!(
                "campaign {} already exists in namespace {}",
                campaign.name, campaign.namespace
            )));
        }
        campaign.id = CampaignId(next(&mut self.seq.campaign));
        self.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, CoreError> {
        self.campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("campaign", id))
    }

    fn find_campaign(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> Result<Option<Campaign>, CoreError> {
        Ok(self
            .campaigns
            .values()
            .find(|c| &c.namespace == namespace && c.name == name)
            .cloned())
    }

    fn find_campaign_by_spec(
        &self,
        spec_id: CampaignSpecId,
    ) -> Result<Option<Campaign>, CoreError> {
        Ok(self
            .campaigns
            .values()
            .find(|c| c.campaign_spec_id == spec_id)
            .cloned())
    }

    fn update_campaign(&mut self, campaign: &Campaign) -> Result<(), CoreError> {
        let row = self
            .campaigns
            .get_mut(&campaign.id)
            .ok_or_else(|| CoreError::not_found("campaign", campaign.id))?;
        *row = campaign.clone();
        Ok(())
    }

    fn list_campaigns(&self) -> Result<Vec<Campaign>, CoreError> {
        Ok(self.campaigns.values().cloned().collect())
    }

    fn get_changeset(&self, id: ChangesetId) -> Result<Changeset, CoreError> {
        self.changesets
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("changeset", id))
    }

    fn list_changesets(&self, opts: &ListChangesetsOpts) -> Result<Vec<Changeset>, CoreError> {
        Ok(self
            .changesets
            .values()
            .filter(|c| opts.matches(c))
            .cloned()
            .collect())
    }

    fn create_changeset(&mut self, changeset: &mut Changeset) -> Result<(), CoreError> {
        if !self.repos.contains_key(&changeset.repo_id) {
            return Err(CoreError::not_found("repository", changeset.repo_id));
        }
        changeset.id = ChangesetId(next(&mut self.seq.changeset));
        self.changesets.insert(changeset.id, changeset.clone());
        Ok(())
    }

    fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), CoreError> {
        let row = self
            .changesets
            .get_mut(&changeset.id)
            .ok_or_else(|| CoreError::not_found("changeset", changeset.id))?;
        *row = changeset.clone();
        Ok(())
    }

    fn delete_changeset(&mut self, id: ChangesetId) -> Result<(), CoreError> {
        self.changesets
            .remove(&id)
            .ok_or_else(|| CoreError::not_found("changeset", id))?;
        self.events.retain(|_, e| e.changeset_id != id);
        Ok(())
    }

    fn upsert_changeset_events(&mut self, events: &[ChangesetEvent]) -> Result<(), CoreError> {
        for event in events {
            if !self.changesets.contains_key(&event.changeset_id) {
                return Err(CoreError::not_found("changeset", event.changeset_id));
            }
            let existing = self
                .events
                .values_mut()
                .find(|stored| stored.identity() == event.identity());
            match existing {
                Some(stored) => stored.update(event),
                None => {
                    let mut stored = event.clone();
                    stored.id = ChangesetEventId(next(&mut self.seq.event));
                    self.events.insert(stored.id, stored);
                }
            }
        }
        Ok(())
    }

    fn list_changeset_events(&self, id: ChangesetId) -> Result<Vec<ChangesetEvent>, CoreError> {
        Ok(self
            .events
            .values()
            .filter(|e| e.changeset_id == id)
            .cloned()
            .collect())
    }

    fn cancel_queued_campaign_changesets(
        &mut self,
        campaign_id: CampaignId,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let mut canceled = 0;
        for changeset in self.changesets.values_mut() {
            if changeset.owned_by_campaign_id != Some(campaign_id) {
                continue;
            }
            let waiting = match changeset.reconciler_state {
                ReconcilerState::Queued | ReconcilerState::Processing => true,
                ReconcilerState::Errored => changeset.num_failures < max_retries,
                ReconcilerState::Completed => false,
            };
            if !waiting {
                continue;
            }
            changeset.reconciler_state = ReconcilerState::Errored;
            changeset.failure_message = Some(CANCELED_FAILURE_MESSAGE.to_string());
            changeset.num_failures = max_retries;
            changeset.updated_at = now;
            canceled += 1;
        }
        Ok(canceled)
    }

    fn enqueue_changesets_to_close(
        &mut self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let mut enqueued = 0;
        for changeset in self.changesets.values_mut() {
            if changeset.owned_by_campaign_id != Some(campaign_id) || !changeset.is_published() {
                continue;
            }
            let finished = changeset.reconciler_state == ReconcilerState::Completed
                && matches!(
                    changeset.external_state,
                    Some(ExternalState::Closed | ExternalState::Merged)
                );
            if finished {
                continue;
            }
            changeset.closing = true;
            changeset.reset_queued();
            changeset.updated_at = now;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    fn list_changeset_sync_data(&self) -> Result<Vec<ChangesetSyncData>, CoreError> {
        let mut latest_event: BTreeMap<ChangesetId, DateTime<Utc>> = BTreeMap::new();
        for event in self.events.values() {
            latest_event
                .entry(event.changeset_id)
                .and_modify(|t| *t = (*t).max(event.updated_at))
                .or_insert(event.updated_at);
        }

        Ok(self
            .changesets
            .values()
            .filter(|c| {
                c.is_published()
                    && !c.is_deleted()
                    && c.reconciler_state != ReconcilerState::Processing
                    && c.campaign_ids.iter().any(|id| {
                        self.campaigns
                            .get(id)
                            .is_some_and(|campaign| !campaign.is_closed())
                    })
            })
            .map(|c| ChangesetSyncData {
                changeset_id: c.id,
                repo_id: c.repo_id,
                updated_at: c.last_synced_at,
                latest_event: latest_event.get(&c.id).copied(),
                external_updated_at: c.external_updated_at,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Mutex-guarded tables plus row locks. Optionally backed by a JSON snapshot
/// written on [`Store::flush`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    locks: RowLocks,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            tables: Mutex::new(tables),
            locks: RowLocks::new(),
            snapshot_path,
        }
    }

    pub(crate) fn tables(&self) -> Result<MutexGuard<'_, Tables>, CoreError> {
        self.tables.lock().map_err(|_| CoreError::Poisoned("store tables"))
    }

    pub fn snapshot_path(&self) -> Option<&std::path::Path> {
        self.snapshot_path.as_deref()
    }
}

impl Store for MemoryStore {
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<CoreError>,
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
    {
        let mut tables = self.tables()?;
        let mut working = tables.clone();
        let value = f(&mut working)?;
        *tables = working;
        Ok(value)
    }

    fn dequeue_changeset(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Option<(Changeset, RowLockGuard<'_>)>, CoreError> {
        let mut tables = self.tables()?;
        let mut held = self.locks.held()?;

        let candidate = tables
            .changesets
            .values()
            .filter(|c| !held.contains(&c.id) && Tables::is_ready(c, now, max_retries))
            .min_by_key(|c| (c.process_after.unwrap_or(c.updated_at), c.id))
            .map(|c| c.id);
        let Some(id) = candidate else {
            return Ok(None);
        };

        let guard = self.locks.claim(&mut held, id);
        drop(held);

        let changeset = tables
            .changesets
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("changeset", id))?;
        changeset.reconciler_state = ReconcilerState::Processing;
        changeset.updated_at = now;
        Ok(Some((changeset.clone(), guard)))
    }

    fn try_lock_changeset(&self, id: ChangesetId) -> Result<Option<RowLockGuard<'_>>, CoreError> {
        self.locks.try_lock(id)
    }

    fn lock_campaign_changesets(
        &self,
        campaign_id: CampaignId,
    ) -> Result<RowLockGuard<'_>, CoreError> {
        let ids: Vec<ChangesetId> = {
            let tables = self.tables()?;
            tables
                .changesets
                .values()
                .filter(|c| {
                    c.campaign_ids.contains(&campaign_id)
                        || c.owned_by_campaign_id == Some(campaign_id)
                })
                .map(|c| c.id)
                .collect()
        };
        self.locks.lock_all(ids)
    }

    fn flush(&self) -> Result<(), CoreError> {
        match &self.snapshot_path {
            Some(path) => self.save_at(path),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
