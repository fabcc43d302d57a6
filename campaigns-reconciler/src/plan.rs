//! Decide the next action for one changeset.

use serde::Serialize;

use campaigns_core::{BranchChange, Changeset, ChangesetSpec, CoreError, StoreTx};

use crate::error::ReconcilerError;

/// Which code-host-relevant fields differ between two branch specs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangesetDelta {
    pub title: bool,
    pub body: bool,
    pub base_ref: bool,
    pub diff: bool,
    pub commit_message: bool,
}

impl ChangesetDelta {
    pub fn between(previous: &BranchChange, current: &BranchChange) -> Self {
        Self {
            title: previous.title != current.title,
            body: previous.body != current.body,
            base_ref: previous.base_ref != current.base_ref,
            diff: previous.diff() != current.diff(),
            commit_message: previous.commit_message() != current.commit_message(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.needs_commit_update() && !self.needs_host_update()
    }

    /// A new commit must be pushed.
    pub fn needs_commit_update(&self) -> bool {
        self.diff || self.commit_message
    }

    /// The host's update endpoint must be called.
    pub fn needs_host_update(&self) -> bool {
        self.title || self.body || self.base_ref
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "delta", rename_all = "snake_case")]
pub enum Action {
    None,
    Sync,
    Close,
    Publish,
    Update(ChangesetDelta),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Sync => "sync",
            Action::Close => "close",
            Action::Publish => "publish",
            Action::Update(_) => "update",
        }
    }
}

/// The chosen action together with the spec it acts on.
#[derive(Debug, Clone)]
pub struct Plan {
    pub action: Action,
    pub spec: Option<ChangesetSpec>,
}

impl Plan {
    fn bare(action: Action) -> Self {
        Self { action, spec: None }
    }
}

pub fn determine_action(tx: &dyn StoreTx, changeset: &Changeset) -> Result<Plan, ReconcilerError> {
    let Some(current_spec_id) = changeset.current_spec_id else {
        let action = if changeset.unsynced {
            Action::Sync
        } else {
            Action::None
        };
        return Ok(Plan::bare(action));
    };

    if changeset.closing {
        return Ok(Plan::bare(Action::Close));
    }

    let spec = tx.get_changeset_spec(current_spec_id)?;
    if tx.find_campaign_by_spec(spec.campaign_spec_id)?.is_none() {
        return Err(CoreError::InvariantViolation(format!(
            "changeset spec {} belongs to campaign spec {} which is not applied to any campaign",
            spec.id, spec.campaign_spec_id
        ))
        .into());
    }
    let current = spec.require_branch()?;

    if !changeset.is_published() {
        let action = if current.published == Some(true) {
            Action::Publish
        } else {
            Action::None
        };
        return Ok(Plan {
            action,
            spec: Some(spec),
        });
    }

    let Some(previous_spec_id) = changeset.previous_spec_id else {
        return Ok(Plan {
            action: Action::None,
            spec: Some(spec),
        });
    };
    let previous_spec = tx.get_changeset_spec(previous_spec_id)?;
    let delta = ChangesetDelta::between(previous_spec.require_branch()?, current);
    let action = if delta.is_empty() {
        Action::None
    } else {
        Action::Update(delta)
    };
    Ok(Plan {
        action,
        spec: Some(spec),
    })
}

#[cfg(test)]
mod tests {
    use campaigns_core::GitCommitDescription;

    use super::*;

    fn branch(title: &str, diff: &str) -> BranchChange {
        BranchChange {
            base_ref: "main".to_string(),
            base_rev: "abc".to_string(),
            head_ref: "campaigns/fix".to_string(),
            title: title.to_string(),
            body: String::new(),
            commits: vec![GitCommitDescription {
                message: "Fix".to_string(),
                diff: diff.to_string(),
                author_name: None,
                author_email: None,
            }],
            published: Some(true),
        }
    }

    #[test]
    fn delta_splits_commit_and_host_changes() {
        let delta = ChangesetDelta::between(&branch("a", "+1"), &branch("a", "+2"));
        assert!(delta.needs_commit_update());
        assert!(!delta.needs_host_update());

        let delta = ChangesetDelta::between(&branch("a", "+1"), &branch("b", "+1"));
        assert!(!delta.needs_commit_update());
        assert!(delta.needs_host_update());

        assert!(ChangesetDelta::between(&branch("a", "+1"), &branch("a", "+1")).is_empty());
    }
}
