//! Bitbucket Server pull request payloads. Bitbucket reports times as Unix
//! milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct User {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// One of `OPEN`, `DECLINED`, `MERGED`.
    pub state: String,
    /// Fully-qualified source ref, e.g. `refs/heads/my-branch`.
    pub from_ref: String,
    pub to_ref: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_date: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_date: DateTime<Utc>,
    #[serde(default)]
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub commit_statuses: Vec<CommitStatus>,
    #[serde(default)]
    pub self_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub user: User,
    /// One of `UNAPPROVED`, `NEEDS_WORK`, `APPROVED`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub committer_timestamp: DateTime<Utc>,
}

/// Action recorded in a pull request's activity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    Approved,
    Unapproved,
    Declined,
    Reviewed,
    Opened,
    Reopened,
    Merged,
    Commented,
    Rescoped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_date: DateTime<Utc>,
    pub user: User,
    pub action: ActivityAction,
}

/// A reviewer withdrawing approval, delivered only through webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStatusEvent {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_date: DateTime<Utc>,
    pub user: User,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub key: String,
    /// One of `FAILED`, `INPROGRESS`, `SUCCESSFUL`.
    pub state: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date_added: DateTime<Utc>,
}

/// Build status reported against one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub commit: String,
    pub status: BuildStatus,
}

impl CommitStatus {
    pub fn key(&self) -> String {
        format!("{}:{}", self.commit, self.status.key)
    }
}
