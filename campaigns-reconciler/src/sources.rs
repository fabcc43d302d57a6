//! Seams to the outside world: code host clients and the git service.
//!
//! Concrete HTTP clients live outside this crate. The reconciler only sees
//! [`ChangesetSource`] per code host (looked up through a [`SourceSet`]) and
//! one [`GitService`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use campaigns_core::{Changeset, HostKind, Repo};

use crate::error::ReconcilerError;

/// What the reconciler wants a changeset on the code host to look like.
#[derive(Debug)]
pub struct ChangesetDraft<'a> {
    pub title: String,
    pub body: String,
    /// Fully-qualified refs.
    pub base_ref: String,
    pub head_ref: String,
    pub repo: &'a Repo,
    /// Sources write the host's answer into the changeset's metadata.
    pub changeset: &'a mut Changeset,
}

/// Client for one code host.
pub trait ChangesetSource: Send + Sync {
    /// Open the changeset. Returns `true` if the host reports that it
    /// already existed; the draft's changeset then carries the existing
    /// changeset's metadata.
    fn create_changeset(&self, draft: &mut ChangesetDraft<'_>) -> Result<bool, ReconcilerError>;

    /// Rewrite title, body, and base ref on the host.
    fn update_changeset(&self, draft: &mut ChangesetDraft<'_>) -> Result<(), ReconcilerError>;

    fn close_changeset(&self, repo: &Repo, changeset: &mut Changeset) -> Result<(), ReconcilerError>;

    /// Refresh the changeset's metadata. Fails with
    /// [`ReconcilerError::ChangesetNotFound`] when the host deleted it.
    fn load_changeset(&self, repo: &Repo, changeset: &mut Changeset) -> Result<(), ReconcilerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub message: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

/// Build a commit on `base_commit` from `patch` and point `target_ref` at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub repository: String,
    pub base_commit: String,
    pub patch: String,
    pub target_ref: String,
    pub commit_info: CommitInfo,
    pub push: bool,
}

pub trait GitService: Send + Sync {
    /// Returns the ref the commit landed on. Diff failures come back as
    /// [`ReconcilerError::DiffApply`].
    fn create_commit_from_patch(&self, request: &CommitRequest) -> Result<String, ReconcilerError>;
}

/// Registered sources keyed by code host.
#[derive(Clone, Default)]
pub struct SourceSet {
    sources: HashMap<HostKind, Arc<dyn ChangesetSource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: HostKind, source: Arc<dyn ChangesetSource>) -> Self {
        self.insert(host, source);
        self
    }

    pub fn insert(&mut self, host: HostKind, source: Arc<dyn ChangesetSource>) {
        self.sources.insert(host, source);
    }

    /// The source serving `repo`, or `MissingCredentials`.
    pub fn for_repo(&self, repo: &Repo) -> Result<Arc<dyn ChangesetSource>, ReconcilerError> {
        self.sources
            .get(&repo.host)
            .cloned()
            .ok_or_else(|| ReconcilerError::MissingCredentials {
                host: repo.host,
                repository: repo.name.clone(),
            })
    }
}

impl fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hosts: Vec<String> = self.sources.keys().map(ToString::to_string).collect();
        hosts.sort();
        f.debug_struct("SourceSet").field("hosts", &hosts).finish()
    }
}
