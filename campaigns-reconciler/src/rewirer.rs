//! Map a new campaign spec's changeset specs onto the campaign's existing
//! changesets.
//!
//! [`plan`] is pure: it decides one operation per spec and one per existing
//! changeset that no spec claims. [`apply`] writes the operations inside the
//! caller's transaction and rebuilds the campaign's membership list.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use campaigns_core::types::ensure_ref_prefix;
use campaigns_core::{
    Campaign, CampaignId, Changeset, ChangesetId, ChangesetSpec, ChangesetSpecDescription,
    ChangesetSpecId, CoreError, ReconcilerState, Repo, RepoId, StoreTx,
};

use crate::error::ReconcilerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Matched and nothing to do.
    None,
    /// Matched a tracked changeset that had errored; queue it again.
    Reenqueue,
    /// Track a changeset another campaign already tracks or owns.
    AttachTracked,
    /// Start tracking a changeset nobody knows yet.
    Track,
    /// New branch changeset owned by this campaign.
    Create,
    /// Owned changeset gets a new spec.
    Update,
    /// Published owned changeset no longer in the spec.
    Close,
    /// Unpublished owned changeset no longer in the spec.
    Delete,
    /// Tracked changeset no longer in the spec.
    Unlink,
}

impl Operation {
    /// Whether the changeset stays in the campaign afterwards.
    pub fn keeps_membership(self) -> bool {
        matches!(
            self,
            Operation::None
                | Operation::Reenqueue
                | Operation::AttachTracked
                | Operation::Track
                | Operation::Create
                | Operation::Update
        )
    }
}

#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub operation: Operation,
    pub spec: Option<ChangesetSpec>,
    /// The matched existing changeset; `None` for `Track` and `Create`.
    pub changeset: Option<Changeset>,
}

#[derive(Debug, Clone, Default)]
pub struct RewirePlan {
    pub ops: Vec<PlannedOp>,
}

impl RewirePlan {
    pub fn count(&self, operation: Operation) -> usize {
        self.ops.iter().filter(|op| op.operation == operation).count()
    }
}

/// What an applied operation touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOp {
    pub operation: Operation,
    /// `None` after `Delete`.
    pub changeset_id: Option<ChangesetId>,
    pub spec_id: Option<ChangesetSpecId>,
}

/// Everything [`plan`] needs to know, gathered by the caller.
#[derive(Debug, Default)]
pub struct RewireInput<'a> {
    /// `None` for a campaign that does not exist yet.
    pub campaign_id: Option<CampaignId>,
    pub specs: &'a [ChangesetSpec],
    /// Changesets currently attached to the campaign.
    pub changesets: &'a [Changeset],
    /// Current specs of the attached changesets.
    pub current_specs: HashMap<ChangesetSpecId, ChangesetSpec>,
    /// Changesets not attached to the campaign that a tracking spec could
    /// refer to.
    pub tracked_elsewhere: &'a [Changeset],
    pub repos: HashMap<RepoId, Repo>,
}

pub fn plan(input: &RewireInput<'_>) -> Result<RewirePlan, ReconcilerError> {
    let mut by_external: HashMap<(RepoId, &str), usize> = HashMap::new();
    let mut by_head_ref: HashMap<(RepoId, String), usize> = HashMap::new();
    for (idx, changeset) in input.changesets.iter().enumerate() {
        if let Some(external_id) = changeset.external_id.as_deref() {
            by_external.insert((changeset.repo_id, external_id), idx);
        }
        let owned = input.campaign_id.is_some() && changeset.owned_by_campaign_id == input.campaign_id;
        if owned {
            if let Some(head_ref) = changeset_head_ref(changeset, &input.current_specs) {
                by_head_ref.insert((changeset.repo_id, head_ref), idx);
            }
        }
    }

    let mut claimed: HashMap<usize, &ChangesetSpec> = HashMap::new();
    let mut ops = Vec::with_capacity(input.specs.len());

    for spec in input.specs {
        if !input.repos.contains_key(&spec.repo_id) {
            return Err(ReconcilerError::RepoNotFound(spec.repo_id));
        }

        let matched = match &spec.description {
            ChangesetSpecDescription::Existing { external_id } => {
                by_external.get(&(spec.repo_id, external_id.as_str())).copied()
            }
            ChangesetSpecDescription::Branch(branch) => by_head_ref
                .get(&(spec.repo_id, ensure_ref_prefix(&branch.head_ref)))
                .copied(),
        };

        if let Some(idx) = matched {
            if let Some(previous) = claimed.insert(idx, spec) {
                return Err(ReconcilerError::DuplicateSpec(
                    previous.rand_id.clone(),
                    spec.rand_id.clone(),
                    input.changesets[idx].id.to_string(),
                ));
            }
        }

        let op = match (&spec.description, matched) {
            (ChangesetSpecDescription::Existing { .. }, Some(idx)) => {
                let changeset = &input.changesets[idx];
                let operation = if changeset.reconciler_state == ReconcilerState::Errored {
                    Operation::Reenqueue
                } else {
                    Operation::None
                };
                PlannedOp {
                    operation,
                    spec: Some(spec.clone()),
                    changeset: Some(changeset.clone()),
                }
            }
            (ChangesetSpecDescription::Existing { external_id }, None) => {
                let elsewhere = input.tracked_elsewhere.iter().find(|c| {
                    c.repo_id == spec.repo_id && c.external_id.as_deref() == Some(external_id.as_str())
                });
                match elsewhere {
                    Some(changeset) => PlannedOp {
                        operation: Operation::AttachTracked,
                        spec: Some(spec.clone()),
                        changeset: Some(changeset.clone()),
                    },
                    None => PlannedOp {
                        operation: Operation::Track,
                        spec: Some(spec.clone()),
                        changeset: None,
                    },
                }
            }
            (ChangesetSpecDescription::Branch(_), Some(idx)) => PlannedOp {
                operation: Operation::Update,
                spec: Some(spec.clone()),
                changeset: Some(input.changesets[idx].clone()),
            },
            (ChangesetSpecDescription::Branch(_), None) => PlannedOp {
                operation: Operation::Create,
                spec: Some(spec.clone()),
                changeset: None,
            },
        };
        ops.push(op);
    }

    for (idx, changeset) in input.changesets.iter().enumerate() {
        if claimed.contains_key(&idx) {
            continue;
        }
        let owned = input.campaign_id.is_some()
            && changeset.owned_by_campaign_id == input.campaign_id
            && changeset.current_spec_id.is_some();
        let operation = match (owned, changeset.is_published()) {
            (true, true) => Operation::Close,
            (true, false) => Operation::Delete,
            (false, _) => Operation::Unlink,
        };
        ops.push(PlannedOp {
            operation,
            spec: None,
            changeset: Some(changeset.clone()),
        });
    }

    Ok(RewirePlan { ops })
}

/// The head ref an owned changeset answers to: the live branch once
/// published, the spec's branch before that.
fn changeset_head_ref(
    changeset: &Changeset,
    current_specs: &HashMap<ChangesetSpecId, ChangesetSpec>,
) -> Option<String> {
    if changeset.is_published() {
        if let Some(branch) = changeset.external_branch.as_deref() {
            return Some(ensure_ref_prefix(branch));
        }
    }
    changeset
        .current_spec_id
        .and_then(|id| current_specs.get(&id))
        .and_then(ChangesetSpec::head_ref)
}

/// Write `plan` and rebuild `campaign.changeset_ids`. The caller persists
/// the campaign.
pub fn apply(
    tx: &mut dyn StoreTx,
    plan: &RewirePlan,
    campaign: &mut Campaign,
    repos: &HashMap<RepoId, Repo>,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedOp>, ReconcilerError> {
    let mut members = Vec::new();
    let mut applied = Vec::with_capacity(plan.ops.len());

    for op in &plan.ops {
        let spec_id = op.spec.as_ref().map(|s| s.id);
        let changeset_id = match op.operation {
            Operation::None => Some(require_changeset(op)?.id),
            Operation::Reenqueue | Operation::AttachTracked => {
                let mut changeset = require_changeset(op)?.clone();
                changeset.attach_campaign(campaign.id);
                if op.operation == Operation::Reenqueue
                    || changeset.reconciler_state == ReconcilerState::Errored
                {
                    changeset.reset_queued();
                }
                changeset.updated_at = now;
                tx.update_changeset(&changeset)?;
                Some(changeset.id)
            }
            Operation::Track => {
                let spec = require_spec(op)?;
                let external_id = spec.external_id().ok_or_else(|| {
                    CoreError::InvariantViolation(format!("spec {} has no external id", spec.id))
                })?;
                let repo = require_repo(repos, spec.repo_id)?;
                let mut changeset = Changeset::new_tracked(repo, external_id, campaign.id, now);
                tx.create_changeset(&mut changeset)?;
                Some(changeset.id)
            }
            Operation::Create => {
                let spec = require_spec(op)?;
                let repo = require_repo(repos, spec.repo_id)?;
                let mut changeset = Changeset::new_owned(repo, spec.id, campaign.id, now);
                tx.create_changeset(&mut changeset)?;
                Some(changeset.id)
            }
            Operation::Update => {
                let spec = require_spec(op)?;
                let mut changeset = require_changeset(op)?.clone();
                changeset.previous_spec_id = changeset.current_spec_id;
                changeset.current_spec_id = Some(spec.id);
                changeset.reset_queued();
                changeset.updated_at = now;
                tx.update_changeset(&changeset)?;
                Some(changeset.id)
            }
            Operation::Close => {
                let mut changeset = require_changeset(op)?.clone();
                changeset.remove_campaign_id(campaign.id);
                changeset.closing = true;
                changeset.reset_queued();
                changeset.updated_at = now;
                tx.update_changeset(&changeset)?;
                Some(changeset.id)
            }
            Operation::Delete => {
                tx.delete_changeset(require_changeset(op)?.id)?;
                None
            }
            Operation::Unlink => {
                let mut changeset = require_changeset(op)?.clone();
                changeset.remove_campaign_id(campaign.id);
                changeset.updated_at = now;
                tx.update_changeset(&changeset)?;
                Some(changeset.id)
            }
        };

        if op.operation.keeps_membership() {
            if let Some(id) = changeset_id {
                if !members.contains(&id) {
                    members.push(id);
                }
            }
        }
        applied.push(AppliedOp {
            operation: op.operation,
            changeset_id,
            spec_id,
        });
    }

    tracing::debug!(
        "campaign {}: {} changesets after rewiring ({} ops)",
        campaign.id,
        members.len(),
        applied.len()
    );
    campaign.changeset_ids = members;
    Ok(applied)
}

fn require_changeset(op: &PlannedOp) -> Result<&Changeset, ReconcilerError> {
    op.changeset.as_ref().ok_or_else(|| {
        CoreError::InvariantViolation(format!("{:?} planned without a changeset", op.operation)).into()
    })
}

fn require_spec(op: &PlannedOp) -> Result<&ChangesetSpec, ReconcilerError> {
    op.spec.as_ref().ok_or_else(|| {
        CoreError::InvariantViolation(format!("{:?} planned without a spec", op.operation)).into()
    })
}

fn require_repo(repos: &HashMap<RepoId, Repo>, id: RepoId) -> Result<&Repo, ReconcilerError> {
    repos.get(&id).ok_or(ReconcilerError::RepoNotFound(id))
}

/// Ids of every changeset in `ops` that is kept, so callers can check
/// membership without re-reading the campaign.
pub fn kept_ids(ops: &[AppliedOp]) -> HashSet<ChangesetId> {
    ops.iter()
        .filter(|op| op.operation.keeps_membership())
        .filter_map(|op| op.changeset_id)
        .collect()
}
