//! User-facing operations: create specs, apply, close, retry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use campaigns_core::types::new_rand_id;
use campaigns_core::{
    Campaign, CampaignId, CampaignSpec, CampaignSpecFile, CampaignSpecId, Changeset, ChangesetId,
    ChangesetSpec, ChangesetSpecDescription, ChangesetSpecId, CoreError, ListChangesetsOpts,
    ReconcilerState, Store, StoreTx,
};

use crate::error::ReconcilerError;
use crate::rewirer::{self, AppliedOp, RewireInput};

/// What [`apply_campaign`] did to the campaign row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyKind {
    Created,
    Updated,
    /// The campaign was already at this spec; nothing was written.
    Unchanged,
}

/// Result of [`apply_campaign`].
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub campaign: Campaign,
    pub kind: ApplyKind,
    /// Empty when `kind` is [`ApplyKind::Unchanged`].
    pub ops: Vec<AppliedOp>,
}

/// Store a campaign spec and its changeset specs. Repositories are
/// resolved by name.
pub fn create_campaign_spec<S: Store>(
    store: &S,
    file: &CampaignSpecFile,
    now: DateTime<Utc>,
) -> Result<CampaignSpec, ReconcilerError> {
    store.transact(|tx| {
        let mut spec = CampaignSpec {
            id: CampaignSpecId(0),
            rand_id: new_rand_id(),
            name: file.name.clone(),
            description: file.description.clone(),
            namespace: file.namespace.clone(),
            author: file.author().to_string(),
            created_at: now,
        };
        tx.create_campaign_spec(&mut spec)?;

        for template in &file.changesets {
            let repo = tx
                .find_repo_by_name(&template.repository)?
                .ok_or_else(|| ReconcilerError::UnknownRepository(template.repository.clone()))?;
            let mut changeset_spec = ChangesetSpec {
                id: ChangesetSpecId(0),
                rand_id: new_rand_id(),
                campaign_spec_id: spec.id,
                repo_id: repo.id,
                description: ChangesetSpecDescription::from(template.change.clone()),
                created_at: now,
            };
            tx.create_changeset_spec(&mut changeset_spec)?;
        }

        tracing::info!(
            "created campaign spec {} ({}) with {} changeset specs",
            spec.id,
            spec.rand_id,
            file.changesets.len()
        );
        Ok(spec)
    })
}

/// Apply a campaign spec: create or update the campaign with the spec's
/// namespace and name, then rewire its changesets.
///
/// Owned changesets still waiting in the reconciler queue are canceled
/// first; the rewiring re-enqueues whatever the new spec still wants.
pub fn apply_campaign<S: Store>(
    store: &S,
    campaign_spec_id: CampaignSpecId,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<ApplyOutcome, ReconcilerError> {
    loop {
        // The rows to lock depend on which campaign the spec targets. The
        // campaign is read again under the locks; if a concurrent apply
        // created it in between, lock its rows and start over.
        let locked = store.transact(|tx| -> Result<_, ReconcilerError> {
            let spec = tx.get_campaign_spec(campaign_spec_id)?;
            Ok(tx.find_campaign(&spec.namespace, &spec.name)?.map(|c| c.id))
        })?;
        let _locks = match locked {
            Some(id) => Some(store.lock_campaign_changesets(id)?),
            None => None,
        };

        let outcome = store.transact(|tx| apply_locked(tx, campaign_spec_id, locked, max_retries, now))?;
        let Some(outcome) = outcome else {
            tracing::debug!("campaign spec {campaign_spec_id}: target campaign changed while locking, retrying");
            continue;
        };

        tracing::info!(
            "applied campaign spec {} to campaign {} ({:?}, {} changesets)",
            campaign_spec_id,
            outcome.campaign.id,
            outcome.kind,
            outcome.campaign.changeset_ids.len()
        );
        return Ok(outcome);
    }
}

/// The apply proper, run inside one transaction while the rows of `locked`
/// are held. `None` when the campaign found now is not the one locked.
fn apply_locked(
    tx: &mut dyn StoreTx,
    campaign_spec_id: CampaignSpecId,
    locked: Option<CampaignId>,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<Option<ApplyOutcome>, ReconcilerError> {
    let spec = tx.get_campaign_spec(campaign_spec_id)?;
    let existing = tx.find_campaign(&spec.namespace, &spec.name)?;
    if existing.as_ref().map(|c| c.id) != locked {
        return Ok(None);
    }

    let (mut campaign, kind) = match existing {
        Some(campaign) if campaign.is_closed() => {
            return Err(ReconcilerError::ApplyClosedCampaign(campaign.name));
        }
        Some(campaign) if campaign.campaign_spec_id == spec.id => {
            tracing::debug!("campaign {}: spec {} already applied", campaign.id, spec.id);
            return Ok(Some(ApplyOutcome {
                campaign,
                kind: ApplyKind::Unchanged,
                ops: Vec::new(),
            }));
        }
        Some(mut campaign) => {
            let canceled = tx.cancel_queued_campaign_changesets(campaign.id, max_retries, now)?;
            if canceled > 0 {
                tracing::info!("campaign {}: canceled {canceled} queued changesets", campaign.id);
            }
            campaign.campaign_spec_id = spec.id;
            campaign.description = spec.description.clone();
            campaign.author = spec.author.clone();
            campaign.updated_at = now;
            (campaign, ApplyKind::Updated)
        }
        None => {
            let mut campaign = Campaign {
                id: CampaignId(0),
                name: spec.name.clone(),
                description: spec.description.clone(),
                namespace: spec.namespace.clone(),
                author: spec.author.clone(),
                campaign_spec_id: spec.id,
                changeset_ids: Vec::new(),
                closed_at: None,
                created_at: now,
                updated_at: now,
            };
            tx.create_campaign(&mut campaign)?;
            (campaign, ApplyKind::Created)
        }
    };

    let specs = tx.list_changeset_specs(spec.id)?;
    let changesets = tx.list_changesets(&ListChangesetsOpts {
        campaign_id: Some(campaign.id),
        ..Default::default()
    })?;
    let tracked_elsewhere = tracked_elsewhere(&*tx, &specs, campaign.id)?;
    let mut current_specs = HashMap::new();
    for changeset in &changesets {
        if let Some(id) = changeset.current_spec_id {
            current_specs.insert(id, tx.get_changeset_spec(id)?);
        }
    }
    let repos: HashMap<_, _> = tx.list_repos()?.into_iter().map(|r| (r.id, r)).collect();

    let input = RewireInput {
        campaign_id: Some(campaign.id),
        specs: &specs,
        changesets: &changesets,
        current_specs,
        tracked_elsewhere: &tracked_elsewhere,
        repos,
    };
    let plan = rewirer::plan(&input)?;
    let ops = rewirer::apply(tx, &plan, &mut campaign, &input.repos, now)?;
    tx.update_campaign(&campaign)?;

    Ok(Some(ApplyOutcome { campaign, kind, ops }))
}

/// Changesets outside the campaign that a tracking spec refers to.
fn tracked_elsewhere(
    tx: &dyn StoreTx,
    specs: &[ChangesetSpec],
    campaign_id: CampaignId,
) -> Result<Vec<Changeset>, CoreError> {
    let mut found = Vec::new();
    for spec in specs {
        let Some(external_id) = spec.external_id() else {
            continue;
        };
        let matches = tx.list_changesets(&ListChangesetsOpts {
            repo_id: Some(spec.repo_id),
            external_id: Some(external_id.to_string()),
            ..Default::default()
        })?;
        found.extend(
            matches
                .into_iter()
                .filter(|c| !c.campaign_ids.contains(&campaign_id)),
        );
    }
    Ok(found)
}

/// Close a campaign. With `close_changesets`, every published changeset it
/// owns is queued for closing on its code host. Closing twice is a no-op.
pub fn close_campaign<S: Store>(
    store: &S,
    campaign_id: CampaignId,
    close_changesets: bool,
    now: DateTime<Utc>,
) -> Result<Campaign, ReconcilerError> {
    let _locks = store.lock_campaign_changesets(campaign_id)?;
    store.transact(|tx| {
        let mut campaign = tx.get_campaign(campaign_id)?;
        if campaign.is_closed() {
            return Ok(campaign);
        }
        campaign.closed_at = Some(now);
        campaign.updated_at = now;
        tx.update_campaign(&campaign)?;
        if close_changesets {
            let queued = tx.enqueue_changesets_to_close(campaign_id, now)?;
            tracing::info!("campaign {campaign_id}: queued {queued} changesets for closing");
        }
        Ok(campaign)
    })
}

/// Put a failed changeset back in the queue with a clean failure count.
pub fn retry_changeset<S: Store>(
    store: &S,
    changeset_id: ChangesetId,
    now: DateTime<Utc>,
) -> Result<Changeset, ReconcilerError> {
    store.transact(|tx| {
        let mut changeset = tx.get_changeset(changeset_id)?;
        if changeset.reconciler_state == ReconcilerState::Processing {
            return Err(CoreError::InvalidInput(format!(
                "changeset {changeset_id} is being processed"
            ))
            .into());
        }
        changeset.reset_queued();
        changeset.updated_at = now;
        tx.update_changeset(&changeset)?;
        Ok(changeset)
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use campaigns_core::{MemoryStore, Namespace};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    fn file() -> CampaignSpecFile {
        CampaignSpecFile {
            name: "empty".to_string(),
            description: String::new(),
            namespace: Namespace::User("alice".to_string()),
            author: None,
            changesets: Vec::new(),
        }
    }

    #[test]
    fn apply_reports_created_updated_and_unchanged() {
        let store = MemoryStore::new();
        let first = create_campaign_spec(&store, &file(), now()).unwrap();
        let created = apply_campaign(&store, first.id, 5, now()).unwrap();
        assert_eq!(created.kind, ApplyKind::Created);
        assert!(created.ops.is_empty());

        let again = apply_campaign(&store, first.id, 5, now()).unwrap();
        assert_eq!(again.kind, ApplyKind::Unchanged);

        let second = create_campaign_spec(&store, &file(), now()).unwrap();
        let updated = apply_campaign(&store, second.id, 5, now()).unwrap();
        assert_eq!(updated.kind, ApplyKind::Updated);
        assert_eq!(updated.campaign.id, created.campaign.id);
        assert_eq!(updated.campaign.campaign_spec_id, second.id);
    }

    #[test]
    fn apply_backs_off_when_the_target_campaign_is_not_the_locked_one() {
        let store = MemoryStore::new();
        let spec = create_campaign_spec(&store, &file(), now()).unwrap();

        // A campaign appeared after the rows were chosen for locking.
        let stale = store
            .transact(|tx| apply_locked(tx, spec.id, Some(CampaignId(42)), 5, now()))
            .unwrap();
        assert!(stale.is_none());
        let campaigns = store.transact(|tx| tx.list_campaigns()).unwrap();
        assert!(campaigns.is_empty(), "nothing written on a stale lookup");

        let fresh = store
            .transact(|tx| apply_locked(tx, spec.id, None, 5, now()))
            .unwrap()
            .expect("matching lookup applies");
        assert_eq!(fresh.kind, ApplyKind::Created);

        let stale = store
            .transact(|tx| apply_locked(tx, spec.id, None, 5, now()))
            .unwrap();
        assert!(stale.is_none(), "campaign now exists but was not locked");
    }
}
