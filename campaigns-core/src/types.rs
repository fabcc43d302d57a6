//! Domain types for campaigns and changesets.
//!
//! Timestamps are `DateTime<Utc>`; "not yet happened" is `None`, never a zero
//! timestamp. All types are serializable via serde so the store snapshot and
//! the CLI's JSON output share one representation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::metadata::HostMetadata;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a [`Campaign`].
    CampaignId
);
id_newtype!(
    /// Identifier of a [`CampaignSpec`].
    CampaignSpecId
);
id_newtype!(
    /// Identifier of a [`ChangesetSpec`].
    ChangesetSpecId
);
id_newtype!(
    /// Identifier of a [`Changeset`].
    ChangesetId
);
id_newtype!(
    /// Identifier of a stored [`crate::events::ChangesetEvent`].
    ChangesetEventId
);
id_newtype!(
    /// Identifier of a [`Repo`].
    RepoId
);

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The code host a repository (and so its changesets) lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostKind {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "gitlab")]
    GitLab,
    #[serde(rename = "bitbucketserver")]
    BitbucketServer,
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::GitHub => write!(f, "github"),
            HostKind::GitLab => write!(f, "gitlab"),
            HostKind::BitbucketServer => write!(f, "bitbucketserver"),
        }
    }
}

/// State of a changeset on the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalState {
    Open,
    Closed,
    Merged,
    Deleted,
}

impl fmt::Display for ExternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalState::Open => write!(f, "OPEN"),
            ExternalState::Closed => write!(f, "CLOSED"),
            ExternalState::Merged => write!(f, "MERGED"),
            ExternalState::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Aggregate review state of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    #[default]
    Pending,
    Commented,
    Dismissed,
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewState::Approved => write!(f, "APPROVED"),
            ReviewState::ChangesRequested => write!(f, "CHANGES_REQUESTED"),
            ReviewState::Pending => write!(f, "PENDING"),
            ReviewState::Commented => write!(f, "COMMENTED"),
            ReviewState::Dismissed => write!(f, "DISMISSED"),
        }
    }
}

/// Combined CI state of a changeset's head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckState {
    #[default]
    Unknown,
    Pending,
    Passed,
    Failed,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckState::Unknown => write!(f, "UNKNOWN"),
            CheckState::Pending => write!(f, "PENDING"),
            CheckState::Passed => write!(f, "PASSED"),
            CheckState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublicationState {
    #[default]
    Unpublished,
    Published,
}

/// Position of a changeset in the reconciler's work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    #[default]
    Queued,
    Processing,
    Errored,
    Completed,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilerState::Queued => write!(f, "queued"),
            ReconcilerState::Processing => write!(f, "processing"),
            ReconcilerState::Errored => write!(f, "errored"),
            ReconcilerState::Completed => write!(f, "completed"),
        }
    }
}

/// Owner of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "name")]
pub enum Namespace {
    User(String),
    Org(String),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::User(name) => write!(f, "user:{name}"),
            Namespace::Org(name) => write!(f, "org:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Git refs
// ---------------------------------------------------------------------------

const HEADS_PREFIX: &str = "refs/heads/";

/// `my-branch` → `refs/heads/my-branch`; fully-qualified refs pass through.
pub fn ensure_ref_prefix(reference: &str) -> String {
    if reference.starts_with("refs/") {
        reference.to_string()
    } else {
        format!("{HEADS_PREFIX}{reference}")
    }
}

/// `refs/heads/my-branch` → `my-branch`.
pub fn abbreviate_ref(reference: &str) -> &str {
    reference.strip_prefix(HEADS_PREFIX).unwrap_or(reference)
}

/// Fresh external identifier for a spec.
pub fn new_rand_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A repository the caller has access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    /// e.g. `github.com/sourcegraph/sourcegraph`.
    pub name: String,
    pub host: HostKind,
    /// Opaque identifier of the code host connection that serves this repo.
    pub external_service_id: String,
}

/// A named, namespaced unit of work grouping many changesets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub namespace: Namespace,
    pub author: String,
    pub campaign_spec_id: CampaignSpecId,
    #[serde(default)]
    pub changeset_ids: Vec<ChangesetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Appends `id` unless it is already a member.
    pub fn add_changeset_id(&mut self, id: ChangesetId) {
        if !self.changeset_ids.contains(&id) {
            self.changeset_ids.push(id);
        }
    }

    pub fn remove_changeset_id(&mut self, id: ChangesetId) {
        self.changeset_ids.retain(|existing| *existing != id);
    }
}

/// Immutable snapshot of a campaign's declared intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSpec {
    pub id: CampaignSpecId,
    /// Random external identifier (UUID v4).
    pub rand_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub namespace: Namespace,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// One commit of a branch changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommitDescription {
    pub message: String,
    pub diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

/// Desired shape of a branch-based changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchChange {
    pub base_ref: String,
    pub base_rev: String,
    pub head_ref: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub commits: Vec<GitCommitDescription>,
    /// `None` leaves publication undecided; `Some(false)` keeps the
    /// changeset unpublished.
    #[serde(default)]
    pub published: Option<bool>,
}

impl BranchChange {
    /// Concatenated diff of every commit.
    pub fn diff(&self) -> String {
        self.commits.iter().map(|c| c.diff.as_str()).collect()
    }

    pub fn commit_message(&self) -> &str {
        self.commits.first().map(|c| c.message.as_str()).unwrap_or("")
    }
}

/// What a changeset spec asks for in its repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangesetSpecDescription {
    /// Track a changeset that already exists on the code host.
    Existing { external_id: String },
    /// Create or update a changeset from a branch.
    Branch(BranchChange),
}

/// Immutable per-repository description belonging to one campaign spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetSpec {
    pub id: ChangesetSpecId,
    pub rand_id: String,
    pub campaign_spec_id: CampaignSpecId,
    pub repo_id: RepoId,
    pub description: ChangesetSpecDescription,
    pub created_at: DateTime<Utc>,
}

impl ChangesetSpec {
    pub fn external_id(&self) -> Option<&str> {
        match &self.description {
            ChangesetSpecDescription::Existing { external_id } => Some(external_id),
            ChangesetSpecDescription::Branch(_) => None,
        }
    }

    pub fn branch(&self) -> Option<&BranchChange> {
        match &self.description {
            ChangesetSpecDescription::Branch(branch) => Some(branch),
            ChangesetSpecDescription::Existing { .. } => None,
        }
    }

    /// Fully-qualified head ref of a branch spec.
    pub fn head_ref(&self) -> Option<String> {
        self.branch().map(|b| ensure_ref_prefix(&b.head_ref))
    }

    /// Branch spec, or [`CoreError::InvariantViolation`] for a tracking spec.
    pub fn require_branch(&self) -> Result<&BranchChange, CoreError> {
        self.branch().ok_or_else(|| {
            CoreError::InvariantViolation(format!(
                "changeset spec {} tracks an existing changeset and has no branch",
                self.id
            ))
        })
    }
}

/// A pull request / merge request managed or observed by one or more campaigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub repo_id: RepoId,
    pub host: HostKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HostMetadata>,
    #[serde(default)]
    pub campaign_ids: Vec<CampaignId>,
    /// Campaign that created this changeset on the code host; `None` when
    /// the changeset is only tracked.
    #[serde(default)]
    pub owned_by_campaign_id: Option<CampaignId>,
    #[serde(default)]
    pub current_spec_id: Option<ChangesetSpecId>,
    #[serde(default)]
    pub previous_spec_id: Option<ChangesetSpecId>,
    #[serde(default)]
    pub publication_state: PublicationState,
    #[serde(default)]
    pub reconciler_state: ReconcilerState,

    #[serde(default)]
    pub external_id: Option<String>,
    /// Abbreviated head branch on the code host.
    #[serde(default)]
    pub external_branch: Option<String>,
    #[serde(default)]
    pub external_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_state: Option<ExternalState>,
    #[serde(default)]
    pub external_review_state: Option<ReviewState>,
    #[serde(default)]
    pub external_check_state: Option<CheckState>,

    /// Pending close requested by detachment or a closed campaign.
    #[serde(default)]
    pub closing: bool,
    /// Metadata must be refreshed from the host before anything else.
    #[serde(default)]
    pub unsynced: bool,
    /// When metadata was last loaded from the code host.
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub num_failures: u32,
    #[serde(default)]
    pub process_after: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Changeset {
    /// A queued, unpublished changeset owned by `campaign` that will be
    /// built from `spec`.
    pub fn new_owned(
        repo: &Repo,
        spec: ChangesetSpecId,
        campaign: CampaignId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut changeset = Self::blank(repo, now);
        changeset.campaign_ids = vec![campaign];
        changeset.owned_by_campaign_id = Some(campaign);
        changeset.current_spec_id = Some(spec);
        changeset
    }

    /// A queued, published, unsynced changeset tracking `external_id`.
    pub fn new_tracked(
        repo: &Repo,
        external_id: &str,
        campaign: CampaignId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut changeset = Self::blank(repo, now);
        changeset.campaign_ids = vec![campaign];
        changeset.external_id = Some(external_id.to_string());
        changeset.publication_state = PublicationState::Published;
        changeset.unsynced = true;
        changeset
    }

    fn blank(repo: &Repo, now: DateTime<Utc>) -> Self {
        Self {
            id: ChangesetId(0),
            repo_id: repo.id,
            host: repo.host,
            metadata: None,
            campaign_ids: Vec::new(),
            owned_by_campaign_id: None,
            current_spec_id: None,
            previous_spec_id: None,
            publication_state: PublicationState::Unpublished,
            reconciler_state: ReconcilerState::Queued,
            external_id: None,
            external_branch: None,
            external_updated_at: None,
            external_deleted_at: None,
            external_state: None,
            external_review_state: None,
            external_check_state: None,
            closing: false,
            unsynced: false,
            last_synced_at: None,
            failure_message: None,
            num_failures: 0,
            process_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the host metadata and the external fields derived from it.
    pub fn set_metadata(&mut self, metadata: HostMetadata) {
        self.host = metadata.host();
        self.external_id = Some(metadata.external_id());
        self.external_branch = Some(abbreviate_ref(&metadata.head_ref()).to_string());
        self.external_updated_at = Some(metadata.updated_at());
        self.metadata = Some(metadata);
    }

    pub fn set_deleted(&mut self, now: DateTime<Utc>) {
        self.external_deleted_at = Some(now);
    }

    pub fn is_deleted(&self) -> bool {
        self.external_deleted_at.is_some()
    }

    pub fn is_published(&self) -> bool {
        self.publication_state == PublicationState::Published
    }

    /// When the changeset was opened on the code host, if known.
    pub fn external_created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().map(HostMetadata::created_at)
    }

    pub fn attach_campaign(&mut self, campaign: CampaignId) {
        if !self.campaign_ids.contains(&campaign) {
            self.campaign_ids.push(campaign);
        }
    }

    pub fn remove_campaign_id(&mut self, campaign: CampaignId) {
        self.campaign_ids.retain(|id| *id != campaign);
    }

    /// Put the changeset back in the queue with clean retry bookkeeping.
    pub fn reset_queued(&mut self) {
        self.reconciler_state = ReconcilerState::Queued;
        self.failure_message = None;
        self.num_failures = 0;
        self.process_after = None;
    }

    /// Whether the published changeset's title, body, or base ref differ
    /// from `desired`.
    pub fn is_outdated(&self, desired: &BranchChange) -> Result<bool, CoreError> {
        let metadata = self.metadata.as_ref().ok_or_else(|| {
            CoreError::InvalidInput(format!("changeset {} has no host metadata", self.id))
        })?;
        Ok(metadata.title() != desired.title
            || metadata.body() != desired.body
            || metadata.base_ref() != ensure_ref_prefix(&desired.base_ref))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repo {
        Repo {
            id: RepoId(1),
            name: "github.com/acme/api".to_string(),
            host: HostKind::GitHub,
            external_service_id: "github".to_string(),
        }
    }

    #[test]
    fn id_display() {
        assert_eq!(ChangesetId(42).to_string(), "42");
        assert_eq!(CampaignId::from(7).to_string(), "7");
    }

    #[test]
    fn ref_helpers() {
        assert_eq!(ensure_ref_prefix("feature"), "refs/heads/feature");
        assert_eq!(ensure_ref_prefix("refs/heads/feature"), "refs/heads/feature");
        assert_eq!(abbreviate_ref("refs/heads/feature"), "feature");
        assert_eq!(abbreviate_ref("feature"), "feature");
    }

    #[test]
    fn campaign_changeset_ids_stay_unique() {
        let now = Utc::now();
        let mut campaign = Campaign {
            id: CampaignId(1),
            name: "c".to_string(),
            description: String::new(),
            namespace: Namespace::User("alice".to_string()),
            author: "alice".to_string(),
            campaign_spec_id: CampaignSpecId(1),
            changeset_ids: Vec::new(),
            closed_at: None,
            created_at: now,
            updated_at: now,
        };
        campaign.add_changeset_id(ChangesetId(3));
        campaign.add_changeset_id(ChangesetId(3));
        campaign.add_changeset_id(ChangesetId(4));
        assert_eq!(campaign.changeset_ids, vec![ChangesetId(3), ChangesetId(4)]);
        campaign.remove_changeset_id(ChangesetId(3));
        assert_eq!(campaign.changeset_ids, vec![ChangesetId(4)]);
    }

    #[test]
    fn tracked_changeset_starts_published_and_unsynced() {
        let changeset = Changeset::new_tracked(&repo(), "1234", CampaignId(9), Utc::now());
        assert!(changeset.is_published());
        assert!(changeset.unsynced);
        assert_eq!(changeset.reconciler_state, ReconcilerState::Queued);
        assert_eq!(changeset.owned_by_campaign_id, None);
        assert_eq!(changeset.external_id.as_deref(), Some("1234"));
    }

    #[test]
    fn reset_queued_clears_retry_bookkeeping() {
        let mut changeset =
            Changeset::new_owned(&repo(), ChangesetSpecId(1), CampaignId(1), Utc::now());
        changeset.reconciler_state = ReconcilerState::Errored;
        changeset.failure_message = Some("boom".to_string());
        changeset.num_failures = 3;
        changeset.process_after = Some(Utc::now());
        changeset.reset_queued();
        assert_eq!(changeset.reconciler_state, ReconcilerState::Queued);
        assert_eq!(changeset.failure_message, None);
        assert_eq!(changeset.num_failures, 0);
        assert_eq!(changeset.process_after, None);
    }

    #[test]
    fn enums_serialize_in_host_vocabulary() {
        let json = serde_json::to_string(&ReviewState::ChangesRequested).expect("serialize");
        assert_eq!(json, "\"CHANGES_REQUESTED\"");
        let json = serde_json::to_string(&ReconcilerState::Errored).expect("serialize");
        assert_eq!(json, "\"errored\"");
    }
}
