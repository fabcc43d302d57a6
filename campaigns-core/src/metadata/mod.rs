//! Per-host changeset metadata.
//!
//! [`HostMetadata`] is a tagged union keyed by code host. State derivation
//! dispatches on the tag; each host module only describes payload shapes.

pub mod bitbucket;
pub mod github;
pub mod gitlab;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ensure_ref_prefix, HostKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "host", content = "pull_request", rename_all = "snake_case")]
pub enum HostMetadata {
    GitHub(github::PullRequest),
    GitLab(gitlab::MergeRequest),
    BitbucketServer(bitbucket::PullRequest),
}

impl HostMetadata {
    pub fn host(&self) -> HostKind {
        match self {
            HostMetadata::GitHub(_) => HostKind::GitHub,
            HostMetadata::GitLab(_) => HostKind::GitLab,
            HostMetadata::BitbucketServer(_) => HostKind::BitbucketServer,
        }
    }

    /// The host's own identifier: PR number, MR iid, or PR id.
    pub fn external_id(&self) -> String {
        match self {
            HostMetadata::GitHub(pr) => pr.number.to_string(),
            HostMetadata::GitLab(mr) => mr.iid.to_string(),
            HostMetadata::BitbucketServer(pr) => pr.id.to_string(),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            HostMetadata::GitHub(pr) => &pr.title,
            HostMetadata::GitLab(mr) => &mr.title,
            HostMetadata::BitbucketServer(pr) => &pr.title,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            HostMetadata::GitHub(pr) => &pr.body,
            HostMetadata::GitLab(mr) => &mr.description,
            HostMetadata::BitbucketServer(pr) => &pr.description,
        }
    }

    /// Fully-qualified head ref, e.g. `refs/heads/my-branch`.
    pub fn head_ref(&self) -> String {
        match self {
            HostMetadata::GitHub(pr) => ensure_ref_prefix(&pr.head_ref_name),
            HostMetadata::GitLab(mr) => ensure_ref_prefix(&mr.source_branch),
            HostMetadata::BitbucketServer(pr) => ensure_ref_prefix(&pr.from_ref),
        }
    }

    /// Fully-qualified base ref.
    pub fn base_ref(&self) -> String {
        match self {
            HostMetadata::GitHub(pr) => ensure_ref_prefix(&pr.base_ref_name),
            HostMetadata::GitLab(mr) => ensure_ref_prefix(&mr.target_branch),
            HostMetadata::BitbucketServer(pr) => ensure_ref_prefix(&pr.to_ref),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            HostMetadata::GitHub(pr) => pr.created_at,
            HostMetadata::GitLab(mr) => mr.created_at,
            HostMetadata::BitbucketServer(pr) => pr.created_date,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            HostMetadata::GitHub(pr) => pr.updated_at,
            HostMetadata::GitLab(mr) => mr.updated_at,
            HostMetadata::BitbucketServer(pr) => pr.updated_date,
        }
    }

    /// Whether review state lives on the synced object. GitHub only exposes
    /// reviews as timeline events, so its review state always comes from the
    /// event log.
    pub fn carries_review_state(&self) -> bool {
        match self {
            HostMetadata::GitHub(_) => false,
            HostMetadata::GitLab(_) | HostMetadata::BitbucketServer(_) => true,
        }
    }
}
