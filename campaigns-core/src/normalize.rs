//! Event normalizer: host payloads → [`ChangesetEvent`]s.
//!
//! Two entry points share the same per-payload rules:
//! - [`events_from_metadata`] walks a synced changeset's metadata (GitHub
//!   timeline items, Bitbucket activities and commit statuses, GitLab
//!   approval notes and pipelines);
//! - [`normalize_webhook`] turns a single webhook delivery into an event.
//!
//! Keys are the host's natural identity for the occurrence, so a payload
//! seen through both a sync and a webhook collapses into one stored event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::{ChangesetEvent, EventKind, EventMetadata};
use crate::metadata::bitbucket::{self, ActivityAction};
use crate::metadata::github::{self, TimelineItem};
use crate::metadata::gitlab::{self, ReviewNote};
use crate::metadata::HostMetadata;
use crate::types::{Changeset, ChangesetEventId, ChangesetId};

/// A single webhook delivery, already matched to a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "host", content = "event", rename_all = "snake_case")]
pub enum WebhookPayload {
    GitHub(TimelineItem),
    BitbucketServer(BitbucketWebhookEvent),
    GitLab(GitLabWebhookEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BitbucketWebhookEvent {
    Activity(bitbucket::Activity),
    ParticipantStatus(bitbucket::ParticipantStatusEvent),
    CommitStatus(bitbucket::CommitStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitLabWebhookEvent {
    Note(gitlab::Note),
    Pipeline(gitlab::Pipeline),
    Closed(gitlab::StateChange),
    Merged(gitlab::StateChange),
    Reopened(gitlab::StateChange),
}

/// Every event implied by the changeset's current host metadata.
pub fn events_from_metadata(changeset: &Changeset, now: DateTime<Utc>) -> Vec<ChangesetEvent> {
    let Some(metadata) = &changeset.metadata else {
        return Vec::new();
    };
    let id = changeset.id;
    match metadata {
        HostMetadata::GitHub(pr) => pr
            .timeline_items
            .iter()
            .filter_map(|item| github_event(id, item, now))
            .collect(),
        HostMetadata::BitbucketServer(pr) => {
            let mut events = Vec::with_capacity(pr.activities.len() + pr.commit_statuses.len());
            events.extend(
                pr.activities
                    .iter()
                    .map(|activity| bitbucket_activity_event(id, activity, now)),
            );
            events.extend(
                pr.commit_statuses
                    .iter()
                    .map(|status| bitbucket_status_event(id, status, now)),
            );
            events
        }
        HostMetadata::GitLab(mr) => {
            let mut events = Vec::with_capacity(mr.notes.len() + mr.pipelines.len());
            events.extend(
                mr.notes
                    .iter()
                    .filter_map(|note| gitlab_note_event(id, note, now)),
            );
            events.extend(
                mr.pipelines
                    .iter()
                    .map(|pipeline| gitlab_pipeline_event(id, pipeline, now)),
            );
            events
        }
    }
}

/// Normalize one webhook delivery. Returns `None` for payloads that carry no
/// state-relevant information (e.g. a review request for a deleted user).
pub fn normalize_webhook(
    changeset_id: ChangesetId,
    payload: &WebhookPayload,
    now: DateTime<Utc>,
) -> Option<ChangesetEvent> {
    match payload {
        WebhookPayload::GitHub(item) => github_event(changeset_id, item, now),
        WebhookPayload::BitbucketServer(event) => match event {
            BitbucketWebhookEvent::Activity(activity) => {
                Some(bitbucket_activity_event(changeset_id, activity, now))
            }
            BitbucketWebhookEvent::ParticipantStatus(status) => {
                if !status.action.eq_ignore_ascii_case("UNAPPROVED") {
                    return None;
                }
                Some(new_event(
                    changeset_id,
                    EventKind::BitbucketServerParticipantUnapproved,
                    format!(
                        "{}:{}",
                        status.user.name,
                        status.created_date.timestamp_millis()
                    ),
                    EventMetadata::BitbucketParticipantStatus(status.clone()),
                    now,
                ))
            }
            BitbucketWebhookEvent::CommitStatus(status) => {
                Some(bitbucket_status_event(changeset_id, status, now))
            }
        },
        WebhookPayload::GitLab(event) => match event {
            GitLabWebhookEvent::Note(note) => gitlab_note_event(changeset_id, note, now),
            GitLabWebhookEvent::Pipeline(pipeline) => {
                Some(gitlab_pipeline_event(changeset_id, pipeline, now))
            }
            GitLabWebhookEvent::Closed(change) => Some(gitlab_state_event(
                changeset_id,
                EventKind::GitLabClosed,
                change,
                now,
            )),
            GitLabWebhookEvent::Merged(change) => Some(gitlab_state_event(
                changeset_id,
                EventKind::GitLabMerged,
                change,
                now,
            )),
            GitLabWebhookEvent::Reopened(change) => Some(gitlab_state_event(
                changeset_id,
                EventKind::GitLabReopened,
                change,
                now,
            )),
        },
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

fn github_event(
    changeset_id: ChangesetId,
    item: &TimelineItem,
    now: DateTime<Utc>,
) -> Option<ChangesetEvent> {
    let (kind, key, metadata) = match item {
        TimelineItem::Reviewed(review) => (
            EventKind::GitHubReviewed,
            review.database_id.to_string(),
            EventMetadata::GitHubReview(review.clone()),
        ),
        TimelineItem::ReviewDismissed(e) => (
            EventKind::GitHubReviewDismissed,
            format!(
                "{}:{}:{}",
                e.actor.login,
                e.review.database_id,
                nanos(e.created_at)
            ),
            EventMetadata::GitHubReviewDismissed(e.clone()),
        ),
        TimelineItem::ReviewRequested(e) => {
            if e.reviewer_deleted() {
                return None;
            }
            let requested_from = e
                .requested_reviewer
                .as_ref()
                .map(|actor| actor.login.clone())
                .filter(|login| !login.is_empty())
                .or_else(|| e.requested_team.clone())
                .unwrap_or_default();
            (
                EventKind::GitHubReviewRequested,
                format!("{}:{}:{}", e.actor.login, requested_from, nanos(e.created_at)),
                EventMetadata::GitHubReviewRequested(e.clone()),
            )
        }
        TimelineItem::Closed(e) => actor_event(EventKind::GitHubClosed, e),
        TimelineItem::Merged(e) => actor_event(EventKind::GitHubMerged, e),
        TimelineItem::Reopened(e) => actor_event(EventKind::GitHubReopened, e),
        TimelineItem::Commented(comment) => (
            EventKind::GitHubCommented,
            comment.database_id.to_string(),
            EventMetadata::GitHubComment(comment.clone()),
        ),
        TimelineItem::Commit(commit) => (
            EventKind::GitHubCommit,
            commit.oid.clone(),
            EventMetadata::GitHubCommit(commit.clone()),
        ),
        TimelineItem::CommitStatus(status) => (
            EventKind::GitHubCommitStatus,
            hashed_key(&[
                &status.sha,
                &status.state,
                &status.context,
                &nanos(status.received_at).to_string(),
            ]),
            EventMetadata::GitHubCommitStatus(status.clone()),
        ),
        TimelineItem::CheckSuite(suite) => (
            EventKind::GitHubCheckSuite,
            hashed_key(&[
                &suite.id,
                &suite.status,
                &suite.conclusion,
                &nanos(suite.received_at).to_string(),
            ]),
            EventMetadata::GitHubCheckSuite(suite.clone()),
        ),
        TimelineItem::CheckRun(run) => (
            EventKind::GitHubCheckRun,
            hashed_key(&[
                &run.id,
                &run.status,
                &run.conclusion,
                &nanos(run.received_at).to_string(),
            ]),
            EventMetadata::GitHubCheckRun(run.clone()),
        ),
    };
    Some(new_event(changeset_id, kind, key, metadata, now))
}

fn actor_event(kind: EventKind, e: &github::ActorEvent) -> (EventKind, String, EventMetadata) {
    (
        kind,
        format!("{}:{}", e.actor.login, nanos(e.created_at)),
        EventMetadata::GitHubActor(e.clone()),
    )
}

// ---------------------------------------------------------------------------
// Bitbucket Server
// ---------------------------------------------------------------------------

fn bitbucket_activity_event(
    changeset_id: ChangesetId,
    activity: &bitbucket::Activity,
    now: DateTime<Utc>,
) -> ChangesetEvent {
    let kind = match activity.action {
        ActivityAction::Approved => EventKind::BitbucketServerApproved,
        ActivityAction::Unapproved => EventKind::BitbucketServerUnapproved,
        ActivityAction::Declined => EventKind::BitbucketServerDeclined,
        ActivityAction::Reviewed => EventKind::BitbucketServerReviewed,
        ActivityAction::Opened => EventKind::BitbucketServerOpened,
        ActivityAction::Reopened => EventKind::BitbucketServerReopened,
        ActivityAction::Merged => EventKind::BitbucketServerMerged,
        ActivityAction::Commented => EventKind::BitbucketServerCommented,
        ActivityAction::Rescoped => EventKind::BitbucketServerRescoped,
    };
    new_event(
        changeset_id,
        kind,
        activity.id.to_string(),
        EventMetadata::BitbucketActivity(activity.clone()),
        now,
    )
}

fn bitbucket_status_event(
    changeset_id: ChangesetId,
    status: &bitbucket::CommitStatus,
    now: DateTime<Utc>,
) -> ChangesetEvent {
    new_event(
        changeset_id,
        EventKind::BitbucketServerCommitStatus,
        status.key(),
        EventMetadata::BitbucketCommitStatus(status.clone()),
        now,
    )
}

// ---------------------------------------------------------------------------
// GitLab
// ---------------------------------------------------------------------------

fn gitlab_note_event(
    changeset_id: ChangesetId,
    note: &gitlab::Note,
    now: DateTime<Utc>,
) -> Option<ChangesetEvent> {
    let kind = match note.to_review()? {
        ReviewNote::Approved => EventKind::GitLabApproved,
        ReviewNote::Unapproved => EventKind::GitLabUnapproved,
    };
    Some(new_event(
        changeset_id,
        kind,
        note.id.to_string(),
        EventMetadata::GitLabNote(note.clone()),
        now,
    ))
}

fn gitlab_pipeline_event(
    changeset_id: ChangesetId,
    pipeline: &gitlab::Pipeline,
    now: DateTime<Utc>,
) -> ChangesetEvent {
    new_event(
        changeset_id,
        EventKind::GitLabPipeline,
        pipeline.id.to_string(),
        EventMetadata::GitLabPipeline(pipeline.clone()),
        now,
    )
}

fn gitlab_state_event(
    changeset_id: ChangesetId,
    kind: EventKind,
    change: &gitlab::StateChange,
    now: DateTime<Utc>,
) -> ChangesetEvent {
    new_event(
        changeset_id,
        kind,
        format!("{}:{}", change.user.username, nanos(change.created_at)),
        EventMetadata::GitLabStateChange(change.clone()),
        now,
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_event(
    changeset_id: ChangesetId,
    kind: EventKind,
    key: String,
    metadata: EventMetadata,
    now: DateTime<Utc>,
) -> ChangesetEvent {
    ChangesetEvent {
        id: ChangesetEventId(0),
        changeset_id,
        kind,
        key,
        metadata,
        created_at: now,
        updated_at: now,
    }
}

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or_else(|| t.timestamp_micros() * 1_000)
}

/// Short stable digest for keys built from several mutable fields.
fn hashed_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
