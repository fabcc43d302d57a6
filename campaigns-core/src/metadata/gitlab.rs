//! GitLab merge request payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const APPROVED_BODY: &str = "approved this merge request";
const UNAPPROVED_BODY: &str = "unapproved this merge request";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct User {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// One of `opened`, `closed`, `locked`, `merged`.
    pub state: String,
    #[serde(default)]
    pub web_url: String,
    pub source_branch: String,
    pub target_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Vec<Note>,
    /// Pipelines of the merge request, newest first.
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub head_pipeline: Option<Pipeline>,
}

/// A note on a merge request. System notes record approvals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub author: User,
    pub body: String,
    #[serde(default)]
    pub system: bool,
    pub created_at: DateTime<Utc>,
}

/// Approval activity extracted from a system note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewNote {
    Approved,
    Unapproved,
}

impl Note {
    /// The approval this note records, if it is an approval system note.
    pub fn to_review(&self) -> Option<ReviewNote> {
        if !self.system {
            return None;
        }
        match self.body.as_str() {
            APPROVED_BODY => Some(ReviewNote::Approved),
            UNAPPROVED_BODY => Some(ReviewNote::Unapproved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    /// One of `created`, `pending`, `running`, `success`, `failed`,
    /// `canceled`, `skipped`, `manual`, `scheduled`.
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// State change of a merge request received through a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub user: User,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(body: &str, system: bool) -> Note {
        Note {
            id: 1,
            author: User {
                username: "alice".to_string(),
            },
            body: body.to_string(),
            system,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn approval_notes_become_reviews() {
        assert_eq!(
            note("approved this merge request", true).to_review(),
            Some(ReviewNote::Approved)
        );
        assert_eq!(
            note("unapproved this merge request", true).to_review(),
            Some(ReviewNote::Unapproved)
        );
        assert_eq!(note("approved this merge request", false).to_review(), None);
        assert_eq!(note("lgtm", true).to_review(), None);
    }
}
