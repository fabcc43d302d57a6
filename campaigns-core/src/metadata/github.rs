//! GitHub pull request payloads, trimmed to what state derivation reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user or bot acting on GitHub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Actor {
    pub login: String,
}

impl From<&str> for Actor {
    fn from(login: &str) -> Self {
        Self {
            login: login.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// One of `OPEN`, `CLOSED`, `MERGED`.
    pub state: String,
    #[serde(default)]
    pub url: String,
    pub head_ref_name: String,
    pub base_ref_name: String,
    #[serde(default)]
    pub head_ref_oid: String,
    #[serde(default)]
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub timeline_items: Vec<TimelineItem>,
    /// Most recent commits with their check results.
    #[serde(default)]
    pub commits: Vec<CommitWithChecks>,
}

/// One entry of a pull request's timeline, also the shape webhooks deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem {
    Reviewed(PullRequestReview),
    ReviewDismissed(ReviewDismissedEvent),
    ReviewRequested(ReviewRequestedEvent),
    Closed(ActorEvent),
    Merged(ActorEvent),
    Reopened(ActorEvent),
    Commented(IssueComment),
    Commit(PullRequestCommit),
    CommitStatus(CommitStatus),
    CheckSuite(CheckSuite),
    CheckRun(CheckRun),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestReview {
    pub database_id: i64,
    pub author: Actor,
    /// One of `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`, `DISMISSED`, `PENDING`.
    pub state: String,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDismissedEvent {
    pub actor: Actor,
    pub review: PullRequestReview,
    #[serde(default)]
    pub dismissal_message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequestedEvent {
    pub actor: Actor,
    #[serde(default)]
    pub requested_reviewer: Option<Actor>,
    #[serde(default)]
    pub requested_team: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReviewRequestedEvent {
    /// Both reviewer and team are blank when the reviewer account was
    /// deleted; such events cannot be matched and are dropped.
    pub fn reviewer_deleted(&self) -> bool {
        let no_user = self
            .requested_reviewer
            .as_ref()
            .map_or(true, |actor| actor.login.is_empty());
        let no_team = self.requested_team.as_deref().map_or(true, str::is_empty);
        no_user && no_team
    }
}

/// Closed, merged and reopened events carry only an actor and a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorEvent {
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub database_id: i64,
    pub author: Actor,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestCommit {
    pub oid: String,
    #[serde(default)]
    pub message: String,
    pub committed_date: DateTime<Utc>,
}

/// A commit status context received through the status webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub sha: String,
    pub context: String,
    pub state: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSuite {
    pub id: String,
    /// One of `COMPLETED`, `IN_PROGRESS`, `QUEUED`, `REQUESTED`.
    pub status: String,
    /// One of `ACTION_REQUIRED`, `CANCELLED`, `FAILURE`, `NEUTRAL`, `SUCCESS`, `TIMED_OUT`.
    #[serde(default)]
    pub conclusion: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub check_runs: Vec<CheckRun>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: String,
    pub received_at: DateTime<Utc>,
}

/// A commit together with its build results, as loaded during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWithChecks {
    pub oid: String,
    pub committed_date: DateTime<Utc>,
    #[serde(default)]
    pub check_suites: Vec<CheckSuite>,
    #[serde(default)]
    pub status_contexts: Vec<StatusContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusContext {
    pub context: String,
    pub state: String,
}
