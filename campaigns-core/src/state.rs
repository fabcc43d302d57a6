//! State engine: derive a changeset's external, review, and check state from
//! its host metadata and its event log.
//!
//! Rules:
//! 1. Events are folded in timestamp order; equal timestamps keep insertion
//!    order (the sort is stable and the store lists events by id).
//! 2. History starts `Open`/`Pending` at the host's creation time.
//! 3. `Merged` is terminal: later close/reopen events do not move it.
//! 4. Review state is aggregated per author with precedence
//!    `ChangesRequested` > `Approved` > `Pending`; a dismissal removes the
//!    author's entry instead of recording a state.
//! 5. When the synced metadata (`external_updated_at`) is newer than the
//!    newest history point, the metadata wins, except for review state on
//!    hosts that only expose reviews as events (GitHub).
//! 6. Check states combine with precedence `Unknown` > `Pending` > `Failed` >
//!    `Passed`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::events::{ChangesetEvent, EventKind, EventMetadata};
use crate::metadata::{bitbucket, github, gitlab, HostMetadata};
use crate::types::{Changeset, CheckState, ExternalState, ReviewState};

/// One point of a changeset's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatesAtTime {
    pub t: DateTime<Utc>,
    pub state: ExternalState,
    pub review_state: ReviewState,
}

/// The derived fields written back onto a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivedState {
    pub external_state: ExternalState,
    pub review_state: ReviewState,
    pub check_state: CheckState,
}

/// Sort events by timestamp, keeping insertion order for ties.
pub fn sort_events(events: &mut [ChangesetEvent]) {
    events.sort_by_key(ChangesetEvent::timestamp);
}

/// Fold `events` into the changeset's state timeline.
pub fn compute_history(
    changeset: &Changeset,
    events: &[ChangesetEvent],
) -> Result<Vec<StatesAtTime>, CoreError> {
    let created_at = changeset.external_created_at().ok_or_else(|| {
        CoreError::InvalidInput(format!(
            "changeset {} has no external creation time",
            changeset.id
        ))
    })?;

    let mut sorted: Vec<&ChangesetEvent> = events.iter().collect();
    sorted.sort_by_key(|event| event.timestamp());

    let mut state = ExternalState::Open;
    let mut review_state = ReviewState::Pending;
    let mut history = vec![StatesAtTime {
        t: created_at,
        state,
        review_state,
    }];
    let mut last_review_by_author: HashMap<&str, ReviewState> = HashMap::new();

    for event in sorted {
        let t = event.timestamp();
        let kind = event.kind;

        if kind.is_close() {
            if state != ExternalState::Merged {
                state = ExternalState::Closed;
                history.push(StatesAtTime { t, state, review_state });
            }
        } else if kind.is_merge() {
            state = ExternalState::Merged;
            history.push(StatesAtTime { t, state, review_state });
        } else if kind.is_reopen() {
            if state != ExternalState::Merged {
                state = ExternalState::Open;
                history.push(StatesAtTime { t, state, review_state });
            }
        } else if kind.is_review() {
            let Some(submitted) = event.review_state() else {
                continue;
            };
            if !matches!(
                submitted,
                ReviewState::Approved | ReviewState::ChangesRequested | ReviewState::Dismissed
            ) {
                continue;
            }
            // Reviews by deleted accounts cannot be attributed.
            let Some(author) = event.review_author() else {
                continue;
            };
            if submitted == ReviewState::Dismissed {
                last_review_by_author.remove(author);
            } else {
                last_review_by_author.insert(author, submitted);
            }
            let aggregate = select_review_state(last_review_by_author.values().copied());
            if aggregate != review_state {
                review_state = aggregate;
                history.push(StatesAtTime { t, state, review_state });
            }
        } else if kind.is_unapproval() {
            let Some(author) = event.review_author() else {
                continue;
            };
            let matched = match kind {
                EventKind::GitHubReviewDismissed => last_review_by_author.contains_key(author),
                _ => last_review_by_author.get(author) == Some(&ReviewState::Approved),
            };
            if !matched {
                tracing::warn!(
                    "ignoring {kind} by {author} on changeset {}: no matching prior review",
                    changeset.id
                );
                continue;
            }
            last_review_by_author.remove(author);
            let aggregate = select_review_state(last_review_by_author.values().copied());
            if aggregate != review_state {
                review_state = aggregate;
                history.push(StatesAtTime { t, state, review_state });
            }
        }
    }

    if let Some(deleted_at) = changeset.external_deleted_at {
        history.push(StatesAtTime {
            t: deleted_at,
            state: ExternalState::Closed,
            review_state,
        });
    }

    Ok(history)
}

/// The history point in effect at `t`, or `None` before the changeset existed.
pub fn state_at(history: &[StatesAtTime], t: DateTime<Utc>) -> Option<StatesAtTime> {
    history.iter().rev().find(|point| point.t <= t).copied()
}

/// Derive all three states for `changeset` from its metadata and events.
pub fn derive_state(
    changeset: &Changeset,
    events: &[ChangesetEvent],
) -> Result<DerivedState, CoreError> {
    let metadata = changeset.metadata.as_ref().ok_or_else(|| {
        CoreError::InvalidInput(format!("changeset {} has no host metadata", changeset.id))
    })?;
    let history = compute_history(changeset, events)?;
    let newest = history.last().copied().ok_or_else(|| {
        CoreError::InvariantViolation(format!("empty history for changeset {}", changeset.id))
    })?;
    let sync_is_newer = changeset
        .external_updated_at
        .is_some_and(|synced| synced > newest.t);

    let external_state = if changeset.is_deleted() {
        ExternalState::Deleted
    } else if sync_is_newer {
        metadata_external_state(metadata)?
    } else {
        newest.state
    };

    let review_state = if sync_is_newer && metadata.carries_review_state() {
        metadata_review_state(metadata)
    } else {
        newest.review_state
    };

    Ok(DerivedState {
        external_state,
        review_state,
        check_state: compute_check_state(changeset, events),
    })
}

/// Derive state and write it onto `changeset`.
pub fn apply_derived_state(
    changeset: &mut Changeset,
    events: &[ChangesetEvent],
) -> Result<DerivedState, CoreError> {
    let derived = derive_state(changeset, events)?;
    changeset.external_state = Some(derived.external_state);
    changeset.external_review_state = Some(derived.review_state);
    changeset.external_check_state = Some(derived.check_state);
    Ok(derived)
}

/// Aggregate individual reviews: any change request wins, then any approval.
pub fn select_review_state(states: impl IntoIterator<Item = ReviewState>) -> ReviewState {
    let states: HashSet<ReviewState> = states.into_iter().collect();
    if states.contains(&ReviewState::ChangesRequested) {
        ReviewState::ChangesRequested
    } else if states.contains(&ReviewState::Approved) {
        ReviewState::Approved
    } else {
        ReviewState::Pending
    }
}

/// Combine individual check results into one state.
pub fn combine_check_states(states: impl IntoIterator<Item = CheckState>) -> CheckState {
    let states: HashSet<CheckState> = states.into_iter().collect();
    if states.is_empty() || states.contains(&CheckState::Unknown) {
        CheckState::Unknown
    } else if states.contains(&CheckState::Pending) {
        CheckState::Pending
    } else if states.contains(&CheckState::Failed) {
        CheckState::Failed
    } else {
        CheckState::Passed
    }
}

// ---------------------------------------------------------------------------
// State from synced metadata
// ---------------------------------------------------------------------------

fn metadata_external_state(metadata: &HostMetadata) -> Result<ExternalState, CoreError> {
    let state = match metadata {
        HostMetadata::GitHub(pr) => match pr.state.as_str() {
            "OPEN" => Some(ExternalState::Open),
            "CLOSED" => Some(ExternalState::Closed),
            "MERGED" => Some(ExternalState::Merged),
            _ => None,
        },
        HostMetadata::BitbucketServer(pr) => match pr.state.as_str() {
            "OPEN" => Some(ExternalState::Open),
            "DECLINED" => Some(ExternalState::Closed),
            "MERGED" => Some(ExternalState::Merged),
            _ => None,
        },
        HostMetadata::GitLab(mr) => match mr.state.as_str() {
            "opened" => Some(ExternalState::Open),
            "closed" | "locked" => Some(ExternalState::Closed),
            "merged" => Some(ExternalState::Merged),
            _ => None,
        },
    };
    state.ok_or_else(|| {
        CoreError::InvalidInput(format!(
            "unknown {} changeset state in metadata",
            metadata.host()
        ))
    })
}

fn metadata_review_state(metadata: &HostMetadata) -> ReviewState {
    match metadata {
        HostMetadata::BitbucketServer(pr) => {
            select_review_state(pr.reviewers.iter().map(|reviewer| {
                match reviewer.status.as_str() {
                    "APPROVED" => ReviewState::Approved,
                    "NEEDS_WORK" => ReviewState::ChangesRequested,
                    _ => ReviewState::Pending,
                }
            }))
        }
        HostMetadata::GitLab(mr) => {
            let mut notes: Vec<&gitlab::Note> = mr.notes.iter().collect();
            notes.sort_by_key(|note| note.created_at);
            let mut approvals: HashMap<&str, ReviewState> = HashMap::new();
            for note in notes {
                match note.to_review() {
                    Some(gitlab::ReviewNote::Approved) => {
                        approvals.insert(note.author.username.as_str(), ReviewState::Approved);
                    }
                    Some(gitlab::ReviewNote::Unapproved) => {
                        approvals.remove(note.author.username.as_str());
                    }
                    None => {}
                }
            }
            select_review_state(approvals.into_values())
        }
        HostMetadata::GitHub(_) => ReviewState::Pending,
    }
}

// ---------------------------------------------------------------------------
// Check state
// ---------------------------------------------------------------------------

/// Combined CI state from the synced snapshot plus events newer than the
/// last sync.
pub fn compute_check_state(changeset: &Changeset, events: &[ChangesetEvent]) -> CheckState {
    let Some(metadata) = &changeset.metadata else {
        return CheckState::Unknown;
    };
    let mut sorted: Vec<&ChangesetEvent> = events.iter().collect();
    sorted.sort_by_key(|event| event.timestamp());
    let last_synced = changeset.external_updated_at;

    match metadata {
        HostMetadata::GitHub(pr) => github_check_state(last_synced, pr, &sorted),
        HostMetadata::BitbucketServer(pr) => bitbucket_check_state(last_synced, pr, &sorted),
        HostMetadata::GitLab(mr) => gitlab_check_state(last_synced, mr, &sorted),
    }
}

fn is_newer(t: DateTime<Utc>, last_synced: Option<DateTime<Utc>>) -> bool {
    last_synced.map_or(true, |synced| t > synced)
}

fn github_check_state(
    last_synced: Option<DateTime<Utc>>,
    pr: &github::PullRequest,
    events: &[&ChangesetEvent],
) -> CheckState {
    let mut contexts: HashMap<String, CheckState> = HashMap::new();

    let latest = pr.commits.iter().max_by_key(|commit| commit.committed_date);
    let mut latest_commit_at = latest.map(|commit| commit.committed_date);
    if let Some(commit) = latest {
        for context in &commit.status_contexts {
            contexts.insert(
                context.context.clone(),
                parse_github_check_state(&context.state),
            );
        }
        for suite in &commit.check_suites {
            record_check_suite(&mut contexts, suite);
        }
    }

    for event in events {
        match &event.metadata {
            EventMetadata::GitHubCommit(commit) if is_newer(commit.committed_date, last_synced) => {
                // A newer head commit invalidates every earlier result.
                if latest_commit_at.map_or(true, |latest| commit.committed_date > latest) {
                    contexts.clear();
                    latest_commit_at = Some(commit.committed_date);
                }
            }
            EventMetadata::GitHubCommitStatus(status) if is_newer(status.received_at, last_synced) => {
                contexts.insert(status.context.clone(), parse_github_check_state(&status.state));
            }
            EventMetadata::GitHubCheckSuite(suite) if is_newer(suite.received_at, last_synced) => {
                record_check_suite(&mut contexts, suite);
            }
            EventMetadata::GitHubCheckRun(run) if is_newer(run.received_at, last_synced) => {
                contexts.insert(
                    run.id.clone(),
                    parse_github_check_suite_state(&run.status, &run.conclusion),
                );
            }
            _ => {}
        }
    }

    combine_check_states(contexts.into_values())
}

fn record_check_suite(contexts: &mut HashMap<String, CheckState>, suite: &github::CheckSuite) {
    if suite.status == "QUEUED" && suite.check_runs.is_empty() {
        tracing::debug!("ignoring queued check suite {} without runs", suite.id);
        return;
    }
    contexts.insert(
        suite.id.clone(),
        parse_github_check_suite_state(&suite.status, &suite.conclusion),
    );
    for run in &suite.check_runs {
        contexts.insert(
            run.id.clone(),
            parse_github_check_suite_state(&run.status, &run.conclusion),
        );
    }
}

/// GitHub commit status context state.
pub fn parse_github_check_state(state: &str) -> CheckState {
    match state {
        "ERROR" | "FAILURE" => CheckState::Failed,
        "EXPECTED" | "PENDING" => CheckState::Pending,
        "SUCCESS" => CheckState::Passed,
        _ => CheckState::Unknown,
    }
}

/// GitHub check suite / check run status and conclusion.
pub fn parse_github_check_suite_state(status: &str, conclusion: &str) -> CheckState {
    match status {
        "IN_PROGRESS" | "QUEUED" | "REQUESTED" => return CheckState::Pending,
        "COMPLETED" => {}
        _ => return CheckState::Unknown,
    }
    match conclusion {
        "SUCCESS" | "NEUTRAL" | "SKIPPED" => CheckState::Passed,
        "ACTION_REQUIRED" => CheckState::Pending,
        "CANCELLED" | "FAILURE" | "TIMED_OUT" => CheckState::Failed,
        _ => CheckState::Unknown,
    }
}

fn bitbucket_check_state(
    last_synced: Option<DateTime<Utc>>,
    pr: &bitbucket::PullRequest,
    events: &[&ChangesetEvent],
) -> CheckState {
    let latest_commit = pr
        .commits
        .iter()
        .max_by_key(|commit| commit.committer_timestamp)
        .map(|commit| commit.id.as_str());

    let mut states: HashMap<String, CheckState> = pr
        .commit_statuses
        .iter()
        .map(|status| (status.key(), parse_bitbucket_build_state(&status.status.state)))
        .collect();

    for event in events {
        let EventMetadata::BitbucketCommitStatus(status) = &event.metadata else {
            continue;
        };
        if Some(status.commit.as_str()) != latest_commit {
            continue;
        }
        if last_synced.is_some_and(|synced| status.status.date_added < synced) {
            continue;
        }
        states.insert(status.key(), parse_bitbucket_build_state(&status.status.state));
    }

    combine_check_states(states.into_values())
}

pub fn parse_bitbucket_build_state(state: &str) -> CheckState {
    match state {
        "FAILED" => CheckState::Failed,
        "INPROGRESS" => CheckState::Pending,
        "SUCCESSFUL" => CheckState::Passed,
        _ => CheckState::Unknown,
    }
}

fn gitlab_check_state(
    last_synced: Option<DateTime<Utc>>,
    mr: &gitlab::MergeRequest,
    events: &[&ChangesetEvent],
) -> CheckState {
    let mut pipeline = mr
        .pipelines
        .iter()
        .max_by_key(|pipeline| pipeline.created_at)
        .or(mr.head_pipeline.as_ref());

    for event in events {
        let EventMetadata::GitLabPipeline(candidate) = &event.metadata else {
            continue;
        };
        if !is_newer(candidate.created_at, last_synced) {
            continue;
        }
        if pipeline.map_or(true, |current| candidate.created_at > current.created_at) {
            pipeline = Some(candidate);
        }
    }

    pipeline.map_or(CheckState::Unknown, |p| parse_gitlab_pipeline_status(&p.status))
}

pub fn parse_gitlab_pipeline_status(status: &str) -> CheckState {
    match status {
        "success" => CheckState::Passed,
        "failed" | "canceled" => CheckState::Failed,
        "pending" | "running" | "created" => CheckState::Pending,
        _ => CheckState::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ERROR", CheckState::Failed)]
    #[case("FAILURE", CheckState::Failed)]
    #[case("EXPECTED", CheckState::Pending)]
    #[case("PENDING", CheckState::Pending)]
    #[case("SUCCESS", CheckState::Passed)]
    #[case("WHATEVER", CheckState::Unknown)]
    fn github_status_contexts(#[case] state: &str, #[case] expected: CheckState) {
        assert_eq!(parse_github_check_state(state), expected);
    }

    #[rstest]
    #[case("IN_PROGRESS", "", CheckState::Pending)]
    #[case("QUEUED", "", CheckState::Pending)]
    #[case("REQUESTED", "", CheckState::Pending)]
    #[case("COMPLETED", "SUCCESS", CheckState::Passed)]
    #[case("COMPLETED", "NEUTRAL", CheckState::Passed)]
    #[case("COMPLETED", "SKIPPED", CheckState::Passed)]
    #[case("COMPLETED", "ACTION_REQUIRED", CheckState::Pending)]
    #[case("COMPLETED", "CANCELLED", CheckState::Failed)]
    #[case("COMPLETED", "FAILURE", CheckState::Failed)]
    #[case("COMPLETED", "TIMED_OUT", CheckState::Failed)]
    #[case("COMPLETED", "", CheckState::Unknown)]
    fn github_check_suites(
        #[case] status: &str,
        #[case] conclusion: &str,
        #[case] expected: CheckState,
    ) {
        assert_eq!(parse_github_check_suite_state(status, conclusion), expected);
    }

    #[rstest]
    #[case("success", CheckState::Passed)]
    #[case("failed", CheckState::Failed)]
    #[case("canceled", CheckState::Failed)]
    #[case("pending", CheckState::Pending)]
    #[case("running", CheckState::Pending)]
    #[case("created", CheckState::Pending)]
    #[case("skipped", CheckState::Unknown)]
    fn gitlab_pipelines(#[case] status: &str, #[case] expected: CheckState) {
        assert_eq!(parse_gitlab_pipeline_status(status), expected);
    }

    #[rstest]
    #[case(&[], CheckState::Unknown)]
    #[case(&[CheckState::Passed, CheckState::Passed], CheckState::Passed)]
    #[case(&[CheckState::Passed, CheckState::Failed], CheckState::Failed)]
    #[case(&[CheckState::Failed, CheckState::Pending], CheckState::Pending)]
    #[case(&[CheckState::Pending, CheckState::Unknown], CheckState::Unknown)]
    fn check_state_precedence(#[case] states: &[CheckState], #[case] expected: CheckState) {
        assert_eq!(combine_check_states(states.iter().copied()), expected);
    }

    #[rstest]
    #[case(&[], ReviewState::Pending)]
    #[case(&[ReviewState::Approved], ReviewState::Approved)]
    #[case(&[ReviewState::Approved, ReviewState::ChangesRequested], ReviewState::ChangesRequested)]
    #[case(&[ReviewState::Pending, ReviewState::Approved], ReviewState::Approved)]
    fn review_precedence(#[case] states: &[ReviewState], #[case] expected: ReviewState) {
        assert_eq!(select_review_state(states.iter().copied()), expected);
    }
}
