//! Canonical changeset events.
//!
//! A [`ChangesetEvent`] is identified by `(changeset_id, kind, key)`; the key
//! is the host's natural identity for the occurrence. Storing an event whose
//! identity already exists patches the stored record instead of appending.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{bitbucket, github, gitlab};
use crate::types::{ChangesetEventId, ChangesetId, ReviewState};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "github:closed")]
    GitHubClosed,
    #[serde(rename = "github:merged")]
    GitHubMerged,
    #[serde(rename = "github:reopened")]
    GitHubReopened,
    #[serde(rename = "github:reviewed")]
    GitHubReviewed,
    #[serde(rename = "github:review_dismissed")]
    GitHubReviewDismissed,
    #[serde(rename = "github:review_requested")]
    GitHubReviewRequested,
    #[serde(rename = "github:commented")]
    GitHubCommented,
    #[serde(rename = "github:commit")]
    GitHubCommit,
    #[serde(rename = "github:commit_status")]
    GitHubCommitStatus,
    #[serde(rename = "github:check_suite")]
    GitHubCheckSuite,
    #[serde(rename = "github:check_run")]
    GitHubCheckRun,

    #[serde(rename = "bitbucketserver:approved")]
    BitbucketServerApproved,
    #[serde(rename = "bitbucketserver:unapproved")]
    BitbucketServerUnapproved,
    #[serde(rename = "bitbucketserver:declined")]
    BitbucketServerDeclined,
    #[serde(rename = "bitbucketserver:reviewed")]
    BitbucketServerReviewed,
    #[serde(rename = "bitbucketserver:opened")]
    BitbucketServerOpened,
    #[serde(rename = "bitbucketserver:reopened")]
    BitbucketServerReopened,
    #[serde(rename = "bitbucketserver:merged")]
    BitbucketServerMerged,
    #[serde(rename = "bitbucketserver:commented")]
    BitbucketServerCommented,
    #[serde(rename = "bitbucketserver:rescoped")]
    BitbucketServerRescoped,
    #[serde(rename = "bitbucketserver:commit_status")]
    BitbucketServerCommitStatus,
    #[serde(rename = "bitbucketserver:participant_status:unapproved")]
    BitbucketServerParticipantUnapproved,

    #[serde(rename = "gitlab:approved")]
    GitLabApproved,
    #[serde(rename = "gitlab:unapproved")]
    GitLabUnapproved,
    #[serde(rename = "gitlab:pipeline")]
    GitLabPipeline,
    #[serde(rename = "gitlab:closed")]
    GitLabClosed,
    #[serde(rename = "gitlab:merged")]
    GitLabMerged,
    #[serde(rename = "gitlab:reopened")]
    GitLabReopened,
}

impl EventKind {
    pub fn is_close(self) -> bool {
        matches!(
            self,
            EventKind::GitHubClosed | EventKind::BitbucketServerDeclined | EventKind::GitLabClosed
        )
    }

    pub fn is_merge(self) -> bool {
        matches!(
            self,
            EventKind::GitHubMerged | EventKind::BitbucketServerMerged | EventKind::GitLabMerged
        )
    }

    pub fn is_reopen(self) -> bool {
        matches!(
            self,
            EventKind::GitHubReopened
                | EventKind::BitbucketServerReopened
                | EventKind::GitLabReopened
        )
    }

    /// A submitted review: approval, change request, or in-place dismissal.
    pub fn is_review(self) -> bool {
        matches!(
            self,
            EventKind::GitHubReviewed
                | EventKind::BitbucketServerApproved
                | EventKind::BitbucketServerReviewed
                | EventKind::GitLabApproved
        )
    }

    /// A reviewer withdrawing an earlier review.
    pub fn is_unapproval(self) -> bool {
        matches!(
            self,
            EventKind::GitHubReviewDismissed
                | EventKind::BitbucketServerUnapproved
                | EventKind::BitbucketServerParticipantUnapproved
                | EventKind::GitLabUnapproved
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde names are the canonical spelling
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{self:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// The host payload an event was normalized from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventMetadata {
    GitHubReview(github::PullRequestReview),
    GitHubReviewDismissed(github::ReviewDismissedEvent),
    GitHubReviewRequested(github::ReviewRequestedEvent),
    GitHubActor(github::ActorEvent),
    GitHubComment(github::IssueComment),
    GitHubCommit(github::PullRequestCommit),
    GitHubCommitStatus(github::CommitStatus),
    GitHubCheckSuite(github::CheckSuite),
    GitHubCheckRun(github::CheckRun),
    BitbucketActivity(bitbucket::Activity),
    BitbucketParticipantStatus(bitbucket::ParticipantStatusEvent),
    BitbucketCommitStatus(bitbucket::CommitStatus),
    GitLabNote(gitlab::Note),
    GitLabPipeline(gitlab::Pipeline),
    GitLabStateChange(gitlab::StateChange),
}

impl EventMetadata {
    /// When the occurrence happened on the host.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventMetadata::GitHubReview(review) => review.updated_at,
            EventMetadata::GitHubReviewDismissed(e) => e.created_at,
            EventMetadata::GitHubReviewRequested(e) => e.created_at,
            EventMetadata::GitHubActor(e) => e.created_at,
            EventMetadata::GitHubComment(c) => c.updated_at,
            EventMetadata::GitHubCommit(c) => c.committed_date,
            EventMetadata::GitHubCommitStatus(s) => s.received_at,
            EventMetadata::GitHubCheckSuite(s) => s.received_at,
            EventMetadata::GitHubCheckRun(r) => r.received_at,
            EventMetadata::BitbucketActivity(a) => a.created_date,
            EventMetadata::BitbucketParticipantStatus(p) => p.created_date,
            EventMetadata::BitbucketCommitStatus(s) => s.status.date_added,
            EventMetadata::GitLabNote(n) => n.created_at,
            EventMetadata::GitLabPipeline(p) => p.created_at,
            EventMetadata::GitLabStateChange(s) => s.created_at,
        }
    }

    /// Merge a newer payload for the same occurrence into this one.
    ///
    /// Reviews and check suites are corrected in place by the host, so only
    /// the fields the newer payload actually carries overwrite; everything
    /// else is replaced wholesale.
    pub fn patch(&mut self, newer: &EventMetadata) {
        match (self, newer) {
            (EventMetadata::GitHubReview(current), EventMetadata::GitHubReview(newer)) => {
                patch_review(current, newer);
            }
            (
                EventMetadata::GitHubReviewDismissed(current),
                EventMetadata::GitHubReviewDismissed(newer),
            ) => {
                patch_review(&mut current.review, &newer.review);
                if !newer.dismissal_message.is_empty() {
                    current.dismissal_message = newer.dismissal_message.clone();
                }
            }
            (EventMetadata::GitHubCheckSuite(current), EventMetadata::GitHubCheckSuite(newer)) => {
                if !newer.status.is_empty() {
                    current.status = newer.status.clone();
                }
                if !newer.conclusion.is_empty() {
                    current.conclusion = newer.conclusion.clone();
                }
                current.received_at = current.received_at.max(newer.received_at);
                for run in &newer.check_runs {
                    match current.check_runs.iter_mut().find(|r| r.id == run.id) {
                        Some(existing) => *existing = run.clone(),
                        None => current.check_runs.push(run.clone()),
                    }
                }
            }
            (current, newer) => *current = newer.clone(),
        }
    }
}

fn patch_review(current: &mut github::PullRequestReview, newer: &github::PullRequestReview) {
    if !newer.state.is_empty() {
        current.state = newer.state.clone();
    }
    if !newer.body.is_empty() {
        current.body = newer.body.clone();
    }
    if !newer.author.login.is_empty() {
        current.author = newer.author.clone();
    }
    current.updated_at = current.updated_at.max(newer.updated_at);
}

/// Map a GitHub review state string onto [`ReviewState`].
pub fn parse_github_review_state(state: &str) -> Option<ReviewState> {
    match state {
        "APPROVED" => Some(ReviewState::Approved),
        "CHANGES_REQUESTED" => Some(ReviewState::ChangesRequested),
        "COMMENTED" => Some(ReviewState::Commented),
        "DISMISSED" => Some(ReviewState::Dismissed),
        "PENDING" => Some(ReviewState::Pending),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetEvent {
    /// Assigned by the store; `0` before the first upsert.
    pub id: ChangesetEventId,
    pub changeset_id: ChangesetId,
    pub kind: EventKind,
    /// Natural key of the occurrence on the host.
    pub key: String,
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangesetEvent {
    /// The dedup identity `(changeset, kind, key)`.
    pub fn identity(&self) -> (ChangesetId, EventKind, &str) {
        (self.changeset_id, self.kind, &self.key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp()
    }

    /// Patch this event with a newer delivery of the same occurrence. Events
    /// with a different identity are left untouched.
    pub fn update(&mut self, newer: &ChangesetEvent) {
        if self.identity() != newer.identity() {
            return;
        }
        self.metadata.patch(&newer.metadata);
        self.updated_at = self.updated_at.max(newer.updated_at);
    }

    /// The review state this event expresses, if it is review-related.
    pub fn review_state(&self) -> Option<ReviewState> {
        match self.kind {
            EventKind::BitbucketServerApproved | EventKind::GitLabApproved => {
                Some(ReviewState::Approved)
            }
            EventKind::BitbucketServerReviewed => Some(ReviewState::ChangesRequested),
            EventKind::GitHubReviewed => match &self.metadata {
                EventMetadata::GitHubReview(review) => parse_github_review_state(&review.state),
                _ => None,
            },
            kind if kind.is_unapproval() => Some(ReviewState::Dismissed),
            _ => None,
        }
    }

    /// Login of the reviewer this event belongs to. `None` when the event is
    /// not review-related or the author account was deleted.
    pub fn review_author(&self) -> Option<&str> {
        let author = match &self.metadata {
            EventMetadata::GitHubReview(review) => review.author.login.as_str(),
            EventMetadata::GitHubReviewDismissed(e) => e.review.author.login.as_str(),
            EventMetadata::BitbucketActivity(a) => a.user.name.as_str(),
            EventMetadata::BitbucketParticipantStatus(p) => p.user.name.as_str(),
            EventMetadata::GitLabNote(n) => n.author.username.as_str(),
            _ => return None,
        };
        (!author.is_empty()).then_some(author)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
