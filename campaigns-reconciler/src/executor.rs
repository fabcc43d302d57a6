//! The reconciler: claim a queued changeset, decide what to do, do it.
//!
//! Remote calls happen outside store transactions. Every write to the
//! changeset row goes through [`Store::transact`] while the worker still
//! holds the row lock obtained from [`Store::dequeue_changeset`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use campaigns_core::types::{abbreviate_ref, ensure_ref_prefix};
use campaigns_core::{
    apply_derived_state, events_from_metadata, Changeset, ChangesetId, ChangesetSpec, CoreError,
    ExternalState, ListChangesetsOpts, PublicationState, ReconcilerState, Repo, RepoId, Store, StoreTx,
};

use crate::error::ReconcilerError;
use crate::plan::{determine_action, Action, ChangesetDelta, Plan};
use crate::retry::mark_errored;
use crate::sources::{ChangesetDraft, CommitInfo, CommitRequest, GitService, SourceSet};

pub const DEFAULT_MAX_RETRIES: u32 = 60;
pub const DEFAULT_SLEEP_BEFORE_SYNC: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Errored changesets with this many failures are not dequeued again.
    pub max_retries: u32,
    /// Pause between pushing a commit and re-reading the changeset, so the
    /// host has a chance to register the new head.
    pub sleep_before_sync: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            sleep_before_sync: DEFAULT_SLEEP_BEFORE_SYNC,
        }
    }
}

/// Result of one [`Reconciler::process_next`] call.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub changeset_id: ChangesetId,
    /// `None` when planning itself failed.
    pub action: Option<Action>,
    pub error: Option<String>,
}

pub struct Reconciler {
    sources: SourceSet,
    git: Arc<dyn GitService>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(sources: SourceSet, git: Arc<dyn GitService>, config: ReconcilerConfig) -> Self {
        Self {
            sources,
            git,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Dequeue and reconcile one changeset. `Ok(None)` when nothing is ready.
    ///
    /// Action failures are recorded on the changeset and reported in the
    /// outcome; only store failures while recording them surface as `Err`.
    pub fn process_next<S: Store>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessOutcome>, ReconcilerError> {
        let Some((changeset, _guard)) = store.dequeue_changeset(now, self.config.max_retries)?
        else {
            return Ok(None);
        };
        let id = changeset.id;

        let (action, result) = match self.plan(store, &changeset) {
            Ok((plan, repo)) => {
                let action = plan.action.clone();
                tracing::debug!("changeset {id}: planned {}", action.name());
                (Some(action), self.execute(store, changeset, &plan, &repo, now))
            }
            Err(err) => (None, Err(err)),
        };

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(
                    "changeset {id}: {} failed: {err}",
                    action.as_ref().map_or("planning", Action::name)
                );
                let max_retries = self.config.max_retries;
                store.transact(|tx| -> Result<(), ReconcilerError> {
                    let mut fresh = tx.get_changeset(id)?;
                    mark_errored(&mut fresh, &err, max_retries, now);
                    tx.update_changeset(&fresh)?;
                    Ok(())
                })?;
                Some(err.to_string())
            }
        };

        Ok(Some(ProcessOutcome {
            changeset_id: id,
            action,
            error,
        }))
    }

    /// Refresh one changeset from its code host outside the reconciler
    /// queue. Returns `Ok(false)` if a worker currently holds the row.
    pub fn sync_changeset<S: Store>(
        &self,
        store: &S,
        id: ChangesetId,
        now: DateTime<Utc>,
    ) -> Result<bool, ReconcilerError> {
        let Some(_guard) = store.try_lock_changeset(id)? else {
            tracing::debug!("changeset {id}: locked, skipping sync");
            return Ok(false);
        };
        let (mut changeset, repo) = store.transact(|tx| -> Result<_, ReconcilerError> {
            let changeset = tx.get_changeset(id)?;
            let repo = load_repo(tx, changeset.repo_id)?;
            Ok((changeset, repo))
        })?;
        self.sync(&mut changeset, &repo, now)?;
        refresh_and_persist(store, changeset, now)?;
        Ok(true)
    }

    fn plan<S: Store>(&self, store: &S, changeset: &Changeset) -> Result<(Plan, Repo), ReconcilerError> {
        store.transact(|tx| {
            let plan = determine_action(tx, changeset)?;
            let repo = load_repo(tx, changeset.repo_id)?;
            Ok((plan, repo))
        })
    }

    fn execute<S: Store>(
        &self,
        store: &S,
        mut changeset: Changeset,
        plan: &Plan,
        repo: &Repo,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        match &plan.action {
            Action::None => {}
            Action::Sync => self.sync(&mut changeset, repo, now)?,
            Action::Close => self.close(&mut changeset, repo, now)?,
            Action::Publish => {
                let spec = plan_spec(plan)?;
                self.publish(store, &mut changeset, spec, repo, now)?;
            }
            Action::Update(delta) => {
                let spec = plan_spec(plan)?;
                self.update(&mut changeset, spec, *delta, repo, now)?;
            }
        }
        finish(store, changeset, now)
    }

    fn publish<S: Store>(
        &self,
        store: &S,
        changeset: &mut Changeset,
        spec: &ChangesetSpec,
        repo: &Repo,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        let branch = spec.require_branch()?;
        let head_ref = ensure_ref_prefix(&branch.head_ref);

        let same_branch = store.transact(|tx| {
            tx.list_changesets(&ListChangesetsOpts {
                repo_id: Some(repo.id),
                external_branch: Some(abbreviate_ref(&head_ref).to_string()),
                ..Default::default()
            })
        })?;
        if same_branch.iter().any(|other| other.id != changeset.id) {
            return Err(ReconcilerError::PublishSameBranch);
        }

        let source = self.sources.for_repo(repo)?;
        self.push_commit(spec, repo)?;

        let mut draft = ChangesetDraft {
            title: branch.title.clone(),
            body: branch.body.clone(),
            base_ref: ensure_ref_prefix(&branch.base_ref),
            head_ref,
            repo,
            changeset: &mut *changeset,
        };
        let exists = source.create_changeset(&mut draft)?;
        if exists && draft.changeset.is_outdated(branch)? {
            tracing::info!(
                "changeset {}: already open on {}, updating",
                draft.changeset.id,
                repo.name
            );
            source.update_changeset(&mut draft)?;
        }

        changeset.publication_state = PublicationState::Published;
        changeset.unsynced = false;
        changeset.last_synced_at = Some(now);
        Ok(())
    }

    fn update(
        &self,
        changeset: &mut Changeset,
        spec: &ChangesetSpec,
        delta: ChangesetDelta,
        repo: &Repo,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        let branch = spec.require_branch()?;
        let source = self.sources.for_repo(repo)?;
        if delta.needs_commit_update() {
            self.push_commit(spec, repo)?;
        }

        if delta.needs_host_update() {
            let mut draft = ChangesetDraft {
                title: branch.title.clone(),
                body: branch.body.clone(),
                base_ref: ensure_ref_prefix(&branch.base_ref),
                head_ref: ensure_ref_prefix(&branch.head_ref),
                repo,
                changeset: &mut *changeset,
            };
            source.update_changeset(&mut draft)?;
            changeset.last_synced_at = Some(now);
            return Ok(());
        }

        if delta.needs_commit_update() {
            if !self.config.sleep_before_sync.is_zero() {
                std::thread::sleep(self.config.sleep_before_sync);
            }
            self.sync(changeset, repo, now)?;
        }
        Ok(())
    }

    fn close(
        &self,
        changeset: &mut Changeset,
        repo: &Repo,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        changeset.closing = false;
        if changeset.external_state == Some(ExternalState::Open) {
            let source = self.sources.for_repo(repo)?;
            source.close_changeset(repo, changeset)?;
        }
        self.sync(changeset, repo, now)
    }

    /// Load fresh metadata. A changeset the host no longer knows is marked
    /// deleted instead of failing.
    fn sync(
        &self,
        changeset: &mut Changeset,
        repo: &Repo,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcilerError> {
        let source = self.sources.for_repo(repo)?;
        match source.load_changeset(repo, changeset) {
            Ok(()) => {}
            Err(ReconcilerError::ChangesetNotFound { external_id }) => {
                tracing::info!("changeset {}: {external_id} deleted on {}", changeset.id, repo.name);
                if !changeset.is_deleted() {
                    changeset.set_deleted(now);
                }
            }
            Err(err) => return Err(err),
        }
        changeset.unsynced = false;
        changeset.last_synced_at = Some(now);
        Ok(())
    }

    fn push_commit(&self, spec: &ChangesetSpec, repo: &Repo) -> Result<String, ReconcilerError> {
        let branch = spec.require_branch()?;
        let first = branch.commits.first();
        let request = CommitRequest {
            repository: repo.name.clone(),
            base_commit: branch.base_rev.clone(),
            patch: branch.diff(),
            target_ref: ensure_ref_prefix(&branch.head_ref),
            commit_info: CommitInfo {
                message: branch.commit_message().to_string(),
                author_name: first.and_then(|c| c.author_name.clone()),
                author_email: first.and_then(|c| c.author_email.clone()),
            },
            push: true,
        };
        let pushed = self.git.create_commit_from_patch(&request)?;
        tracing::debug!("pushed {pushed} to {}", repo.name);
        Ok(pushed)
    }
}

fn plan_spec(plan: &Plan) -> Result<&ChangesetSpec, ReconcilerError> {
    plan.spec.as_ref().ok_or_else(|| {
        CoreError::InvariantViolation(format!("{} planned without a spec", plan.action.name())).into()
    })
}

fn load_repo(tx: &dyn StoreTx, id: RepoId) -> Result<Repo, ReconcilerError> {
    tx.get_repo(id).map_err(|err| {
        if err.is_not_found() {
            ReconcilerError::RepoNotFound(id)
        } else {
            err.into()
        }
    })
}

/// Mark a successful attempt and persist it.
fn finish<S: Store>(store: &S, mut changeset: Changeset, now: DateTime<Utc>) -> Result<(), ReconcilerError> {
    changeset.reconciler_state = ReconcilerState::Completed;
    changeset.failure_message = None;
    changeset.num_failures = 0;
    changeset.process_after = None;
    changeset.updated_at = now;
    refresh_and_persist(store, changeset, now)
}

/// Regenerate events from metadata, re-derive state, and write the row.
fn refresh_and_persist<S: Store>(
    store: &S,
    mut changeset: Changeset,
    now: DateTime<Utc>,
) -> Result<(), ReconcilerError> {
    store.transact(|tx| -> Result<(), ReconcilerError> {
        // Attaching a tracked changeset to another campaign does not take
        // its row lock, so membership is re-read rather than overwritten.
        changeset.campaign_ids = tx.get_changeset(changeset.id)?.campaign_ids;
        if changeset.metadata.is_some() {
            let events = events_from_metadata(&changeset, now);
            tx.upsert_changeset_events(&events)?;
            let events = tx.list_changeset_events(changeset.id)?;
            apply_derived_state(&mut changeset, &events)?;
        }
        tx.update_changeset(&changeset)?;
        Ok(())
    })
}
