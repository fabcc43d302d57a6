//! Persistence seam for campaigns, specs, changesets, and events.
//!
//! All reads and writes go through [`Store::transact`], which hands the
//! closure a [`StoreTx`]. A transaction either commits every write or none.
//! Row locks are separate from transactions: a worker holds the lock on one
//! changeset for the duration of an action, and apply holds the locks on a
//! campaign's changesets for the duration of a rewire.

pub mod locks;
pub mod memory;
pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::events::ChangesetEvent;
use crate::types::{
    Campaign, CampaignId, CampaignSpec, CampaignSpecId, Changeset, ChangesetId, ChangesetSpec,
    ChangesetSpecId, Namespace, ReconcilerState, Repo, RepoId,
};

pub use locks::{RowLockGuard, RowLocks};
pub use memory::MemoryStore;

/// Failure message written onto changesets canceled by an apply.
pub const CANCELED_FAILURE_MESSAGE: &str = "canceled";

/// Filters for [`StoreTx::list_changesets`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ListChangesetsOpts {
    pub campaign_id: Option<CampaignId>,
    pub repo_id: Option<RepoId>,
    pub external_id: Option<String>,
    /// Abbreviated branch name.
    pub external_branch: Option<String>,
    pub owned_by_campaign_id: Option<CampaignId>,
    pub reconciler_state: Option<ReconcilerState>,
}

impl ListChangesetsOpts {
    pub fn matches(&self, changeset: &Changeset) -> bool {
        self.campaign_id
            .map_or(true, |id| changeset.campaign_ids.contains(&id))
            && self.repo_id.map_or(true, |id| changeset.repo_id == id)
            && self
                .external_id
                .as_deref()
                .map_or(true, |id| changeset.external_id.as_deref() == Some(id))
            && self
                .external_branch
                .as_deref()
                .map_or(true, |branch| changeset.external_branch.as_deref() == Some(branch))
            && self
                .owned_by_campaign_id
                .map_or(true, |id| changeset.owned_by_campaign_id == Some(id))
            && self
                .reconciler_state
                .map_or(true, |state| changeset.reconciler_state == state)
    }
}

/// Input to the sync scheduler for one changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetSyncData {
    pub changeset_id: ChangesetId,
    pub repo_id: RepoId,
    /// Last time the changeset was synced from its code host.
    pub updated_at: Option<DateTime<Utc>>,
    /// Newest `updated_at` across the changeset's events.
    pub latest_event: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
}

/// Operations available inside a transaction.
pub trait StoreTx {
    // -- repos --------------------------------------------------------------
    /// Assigns `repo.id`. Fails with `InvalidInput` if the name is taken.
    fn create_repo(&mut self, repo: &mut Repo) -> Result<(), CoreError>;
    fn get_repo(&self, id: RepoId) -> Result<Repo, CoreError>;
    fn find_repo_by_name(&self, name: &str) -> Result<Option<Repo>, CoreError>;
    fn list_repos(&self) -> Result<Vec<Repo>, CoreError>;

    // -- specs --------------------------------------------------------------
    fn create_campaign_spec(&mut self, spec: &mut CampaignSpec) -> Result<(), CoreError>;
    fn get_campaign_spec(&self, id: CampaignSpecId) -> Result<CampaignSpec, CoreError>;
    fn create_changeset_spec(&mut self, spec: &mut ChangesetSpec) -> Result<(), CoreError>;
    fn get_changeset_spec(&self, id: ChangesetSpecId) -> Result<ChangesetSpec, CoreError>;
    fn list_changeset_specs(
        &self,
        campaign_spec_id: CampaignSpecId,
    ) -> Result<Vec<ChangesetSpec>, CoreError>;

    // -- campaigns ----------------------------------------------------------
    fn create_campaign(&mut self, campaign: &mut Campaign) -> Result<(), CoreError>;
    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, CoreError>;
    fn find_campaign(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> Result<Option<Campaign>, CoreError>;
    /// The campaign currently applied with `spec_id`, if any.
    fn find_campaign_by_spec(
        &self,
        spec_id: CampaignSpecId,
    ) -> Result<Option<Campaign>, CoreError>;
    fn update_campaign(&mut self, campaign: &Campaign) -> Result<(), CoreError>;
    fn list_campaigns(&self) -> Result<Vec<Campaign>, CoreError>;

    // -- changesets ---------------------------------------------------------
    fn get_changeset(&self, id: ChangesetId) -> Result<Changeset, CoreError>;
    fn list_changesets(&self, opts: &ListChangesetsOpts) -> Result<Vec<Changeset>, CoreError>;
    /// Assigns `changeset.id`.
    fn create_changeset(&mut self, changeset: &mut Changeset) -> Result<(), CoreError>;
    fn update_changeset(&mut self, changeset: &Changeset) -> Result<(), CoreError>;
    /// Removes the changeset and its events.
    fn delete_changeset(&mut self, id: ChangesetId) -> Result<(), CoreError>;

    // -- events -------------------------------------------------------------
    /// Insert new events and patch existing ones with the same identity.
    fn upsert_changeset_events(&mut self, events: &[ChangesetEvent]) -> Result<(), CoreError>;
    /// Events of one changeset in insertion order.
    fn list_changeset_events(&self, id: ChangesetId) -> Result<Vec<ChangesetEvent>, CoreError>;

    // -- bulk ---------------------------------------------------------------
    /// Mark every owned changeset that is still waiting for the reconciler
    /// as errored with the retry ceiling reached. Returns the affected count.
    fn cancel_queued_campaign_changesets(
        &mut self,
        campaign_id: CampaignId,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError>;

    /// Queue every owned, published changeset for closing unless it already
    /// finished closed or merged. Returns the affected count.
    fn enqueue_changesets_to_close(
        &mut self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError>;

    /// Sync data for published, non-deleted changesets attached to at least
    /// one open campaign, ordered by changeset id. Rows a worker is
    /// processing are left out; errored rows are still synced.
    fn list_changeset_sync_data(&self) -> Result<Vec<ChangesetSyncData>, CoreError>;
}

/// A transactional store with row locking.
pub trait Store: Send + Sync {
    /// Run `f` in a transaction. Writes commit only if `f` returns `Ok`.
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<CoreError>,
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>;

    /// Claim the next changeset ready for the reconciler: `Queued`, or
    /// `Errored` below `max_retries`, whose `process_after` has elapsed and
    /// which nobody holds. The row is marked `Processing` and stays locked
    /// until the guard drops.
    fn dequeue_changeset(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Option<(Changeset, RowLockGuard<'_>)>, CoreError>;

    /// Lock one changeset without waiting. `None` if it is already held.
    fn try_lock_changeset(&self, id: ChangesetId) -> Result<Option<RowLockGuard<'_>>, CoreError>;

    /// Lock every changeset attached to or owned by `campaign_id`, waiting
    /// for current holders to finish.
    fn lock_campaign_changesets(
        &self,
        campaign_id: CampaignId,
    ) -> Result<RowLockGuard<'_>, CoreError>;

    /// Persist committed state, if the store has somewhere to put it.
    fn flush(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
