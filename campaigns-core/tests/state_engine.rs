//! State engine integration tests: history folding, review aggregation,
//! metadata precedence, and check state across the three hosts.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;
use campaigns_core::{
    compute_history, derive_state, events_from_metadata,
    events::{ChangesetEvent, EventKind, EventMetadata},
    metadata::{
        bitbucket::{self, ActivityAction},
        github::{self, Actor, ActorEvent, CommitWithChecks, PullRequestReview, StatusContext},
        gitlab,
    },
    state_at,
    store::{MemoryStore, Store},
    types::ChangesetEventId,
    CampaignId, Changeset, CheckState, CoreError, ExternalState, HostKind, HostMetadata, Repo,
    RepoId, ReviewState,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).single().expect("fixed now")
}

fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

fn repo(host: HostKind) -> Repo {
    Repo {
        id: RepoId(1),
        name: "example.com/acme/api".to_string(),
        host,
        external_service_id: "svc".to_string(),
    }
}

fn github_pr(state: &str, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> github::PullRequest {
    github::PullRequest {
        number: 1234,
        title: "Fix license".to_string(),
        body: String::new(),
        state: state.to_string(),
        url: String::new(),
        head_ref_name: "campaigns/fix".to_string(),
        base_ref_name: "main".to_string(),
        head_ref_oid: String::new(),
        is_draft: false,
        created_at,
        updated_at,
        timeline_items: Vec::new(),
        commits: Vec::new(),
    }
}

fn changeset_with(metadata: HostMetadata) -> Changeset {
    let mut changeset = Changeset::new_tracked(&repo(metadata.host()), "1234", CampaignId(1), days_ago(3));
    changeset.id = campaigns_core::ChangesetId(1);
    changeset.set_metadata(metadata);
    changeset
}

fn event(kind: EventKind, key: &str, metadata: EventMetadata) -> ChangesetEvent {
    ChangesetEvent {
        id: ChangesetEventId(0),
        changeset_id: campaigns_core::ChangesetId(1),
        kind,
        key: key.to_string(),
        metadata,
        created_at: now(),
        updated_at: now(),
    }
}

fn actor_event(kind: EventKind, login: &str, at: DateTime<Utc>) -> ChangesetEvent {
    event(
        kind,
        &format!("{login}:{}", at.timestamp()),
        EventMetadata::GitHubActor(ActorEvent {
            actor: Actor::from(login),
            created_at: at,
        }),
    )
}

fn review(id: i64, login: &str, state: &str, at: DateTime<Utc>) -> ChangesetEvent {
    event(
        EventKind::GitHubReviewed,
        &id.to_string(),
        EventMetadata::GitHubReview(PullRequestReview {
            database_id: id,
            author: Actor::from(login),
            state: state.to_string(),
            body: String::new(),
            created_at: at,
            updated_at: at,
        }),
    )
}

fn dismissal(login: &str, review_id: i64, at: DateTime<Utc>) -> ChangesetEvent {
    let original = review(review_id, login, "APPROVED", at);
    let EventMetadata::GitHubReview(review) = original.metadata else {
        unreachable!()
    };
    event(
        EventKind::GitHubReviewDismissed,
        &format!("admin:{review_id}:{}", at.timestamp()),
        EventMetadata::GitHubReviewDismissed(github::ReviewDismissedEvent {
            actor: Actor::from("admin"),
            review,
            dismissal_message: String::new(),
            created_at: at,
        }),
    )
}

// ---------------------------------------------------------------------------
// 1. History timeline
// ---------------------------------------------------------------------------

#[test]
fn merged_a_day_ago_reads_open_before_and_merged_after() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("MERGED", days_ago(2), days_ago(2))));
    let events = vec![actor_event(EventKind::GitHubMerged, "alice", days_ago(1))];

    let history = compute_history(&changeset, &events).expect("history");
    let at_creation = state_at(&history, days_ago(2)).expect("point at creation");
    assert_eq!(at_creation.state, ExternalState::Open);
    assert_eq!(at_creation.review_state, ReviewState::Pending);

    for t in [days_ago(1), now()] {
        assert_eq!(state_at(&history, t).expect("point").state, ExternalState::Merged);
    }
    assert!(state_at(&history, days_ago(3)).is_none(), "nothing before creation");

    let derived = derive_state(&changeset, &events).expect("derive");
    assert_eq!(derived.external_state, ExternalState::Merged);
}

#[test]
fn merged_is_terminal() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let events = vec![
        actor_event(EventKind::GitHubClosed, "alice", days_ago(4)),
        actor_event(EventKind::GitHubMerged, "alice", days_ago(3)),
        actor_event(EventKind::GitHubClosed, "bob", days_ago(2)),
        actor_event(EventKind::GitHubReopened, "bob", days_ago(1)),
    ];
    let derived = derive_state(&changeset, &events).expect("derive");
    assert_eq!(derived.external_state, ExternalState::Merged);
}

#[test]
fn equal_timestamps_fold_in_insertion_order() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let t = days_ago(1);

    let close_then_reopen = vec![
        actor_event(EventKind::GitHubClosed, "alice", t),
        actor_event(EventKind::GitHubReopened, "alice", t),
    ];
    assert_eq!(
        derive_state(&changeset, &close_then_reopen).unwrap().external_state,
        ExternalState::Open
    );

    let reopen_then_close = vec![
        actor_event(EventKind::GitHubReopened, "alice", t),
        actor_event(EventKind::GitHubClosed, "alice", t),
    ];
    assert_eq!(
        derive_state(&changeset, &reopen_then_close).unwrap().external_state,
        ExternalState::Closed
    );
}

#[test]
fn missing_metadata_is_invalid_input() {
    let changeset = Changeset::new_tracked(&repo(HostKind::GitHub), "1", CampaignId(1), now());
    let err = compute_history(&changeset, &[]).unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)), "got: {err}");
}

#[test]
fn deleted_changeset_closes_history_and_reports_deleted() {
    let mut changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    changeset.set_deleted(days_ago(1));

    let history = compute_history(&changeset, &[]).expect("history");
    let last = history.last().expect("last point");
    assert_eq!(last.t, days_ago(1));
    assert_eq!(last.state, ExternalState::Closed);

    let derived = derive_state(&changeset, &[]).expect("derive");
    assert_eq!(derived.external_state, ExternalState::Deleted);
}

// ---------------------------------------------------------------------------
// 2. Reviews
// ---------------------------------------------------------------------------

#[test]
fn changes_requested_outranks_approval() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let mut events = vec![
        review(1, "alice", "APPROVED", days_ago(4)),
        review(2, "bob", "CHANGES_REQUESTED", days_ago(3)),
    ];
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::ChangesRequested
    );

    events.push(review(3, "bob", "APPROVED", days_ago(2)));
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::Approved
    );
}

#[rstest]
#[case::dismissed_changes_request(&[("alice", "CHANGES_REQUESTED"), ("alice", "DISMISSED")], ReviewState::Pending)]
#[case::dismissal_keeps_other_authors(&[("alice", "APPROVED"), ("bob", "CHANGES_REQUESTED"), ("bob", "DISMISSED")], ReviewState::Approved)]
#[case::changes_requested_wins(&[("alice", "APPROVED"), ("bob", "CHANGES_REQUESTED"), ("carol", "APPROVED")], ReviewState::ChangesRequested)]
#[case::latest_review_per_author(&[("alice", "CHANGES_REQUESTED"), ("alice", "APPROVED")], ReviewState::Approved)]
#[case::no_reviews(&[], ReviewState::Pending)]
fn review_states_fold_per_author(#[case] reviews: &[(&str, &str)], #[case] expected: ReviewState) {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(10), days_ago(10))));
    let events: Vec<ChangesetEvent> = reviews
        .iter()
        .enumerate()
        .map(|(i, (login, state))| review(i as i64 + 1, login, state, days_ago(9 - i as i64)))
        .collect();
    assert_eq!(derive_state(&changeset, &events).unwrap().review_state, expected);
}

#[test]
fn comments_do_not_change_review_state() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let events = vec![
        review(1, "alice", "APPROVED", days_ago(4)),
        review(2, "alice", "COMMENTED", days_ago(3)),
    ];
    let history = compute_history(&changeset, &events).unwrap();
    assert_eq!(history.len(), 2, "a comment adds no history point");
    assert_eq!(history[1].review_state, ReviewState::Approved);
}

#[test]
fn dismissal_removes_the_authors_review() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let events = vec![
        review(1, "alice", "APPROVED", days_ago(4)),
        dismissal("alice", 1, days_ago(3)),
    ];
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::Pending
    );
}

#[test]
fn unmatched_dismissal_is_ignored() {
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("OPEN", days_ago(5), days_ago(5))));
    let events = vec![
        review(1, "alice", "APPROVED", days_ago(4)),
        dismissal("carol", 7, days_ago(3)),
    ];
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::Approved
    );
}

#[test]
fn github_review_state_comes_from_events_even_after_sync() {
    // Metadata updated after every event: external state comes from the
    // synced pull request, review state still from the reviews.
    let changeset = changeset_with(HostMetadata::GitHub(github_pr("CLOSED", days_ago(5), days_ago(1))));
    let events = vec![review(1, "alice", "APPROVED", days_ago(4))];
    let derived = derive_state(&changeset, &events).unwrap();
    assert_eq!(derived.external_state, ExternalState::Closed);
    assert_eq!(derived.review_state, ReviewState::Approved);
}

fn bitbucket_pr(state: &str, reviewers: &[(&str, &str)], updated_at: DateTime<Utc>) -> bitbucket::PullRequest {
    bitbucket::PullRequest {
        id: 77,
        title: "Fix license".to_string(),
        description: String::new(),
        state: state.to_string(),
        from_ref: "refs/heads/campaigns/fix".to_string(),
        to_ref: "refs/heads/main".to_string(),
        created_date: days_ago(5),
        updated_date: updated_at,
        reviewers: reviewers
            .iter()
            .map(|(name, status)| bitbucket::Reviewer {
                user: bitbucket::User {
                    name: name.to_string(),
                },
                status: status.to_string(),
            })
            .collect(),
        activities: Vec::new(),
        commits: Vec::new(),
        commit_statuses: Vec::new(),
        self_link: String::new(),
    }
}

fn bitbucket_activity(id: i64, name: &str, action: ActivityAction, at: DateTime<Utc>) -> ChangesetEvent {
    let kind = match action {
        ActivityAction::Approved => EventKind::BitbucketServerApproved,
        ActivityAction::Unapproved => EventKind::BitbucketServerUnapproved,
        ActivityAction::Reviewed => EventKind::BitbucketServerReviewed,
        ActivityAction::Declined => EventKind::BitbucketServerDeclined,
        _ => EventKind::BitbucketServerCommented,
    };
    event(
        kind,
        &id.to_string(),
        EventMetadata::BitbucketActivity(bitbucket::Activity {
            id,
            created_date: at,
            user: bitbucket::User {
                name: name.to_string(),
            },
            action,
        }),
    )
}

#[test]
fn bitbucket_unapproval_only_undoes_an_approval() {
    let changeset = changeset_with(HostMetadata::BitbucketServer(bitbucket_pr("OPEN", &[], days_ago(5))));
    let events = vec![
        bitbucket_activity(1, "bob", ActivityAction::Reviewed, days_ago(4)),
        bitbucket_activity(2, "bob", ActivityAction::Unapproved, days_ago(3)),
    ];
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::ChangesRequested
    );

    let events = vec![
        bitbucket_activity(1, "bob", ActivityAction::Approved, days_ago(4)),
        bitbucket_activity(2, "bob", ActivityAction::Unapproved, days_ago(3)),
    ];
    assert_eq!(
        derive_state(&changeset, &events).unwrap().review_state,
        ReviewState::Pending
    );
}

#[test]
fn newer_bitbucket_sync_wins_over_history() {
    let changeset = changeset_with(HostMetadata::BitbucketServer(bitbucket_pr(
        "DECLINED",
        &[("alice", "APPROVED"), ("bob", "UNAPPROVED")],
        days_ago(1),
    )));
    let events = vec![bitbucket_activity(1, "bob", ActivityAction::Reviewed, days_ago(2))];
    let derived = derive_state(&changeset, &events).unwrap();
    assert_eq!(derived.external_state, ExternalState::Closed);
    assert_eq!(derived.review_state, ReviewState::Approved);
}

// ---------------------------------------------------------------------------
// 3. Checks
// ---------------------------------------------------------------------------

#[test]
fn github_status_events_newer_than_sync_override_snapshot() {
    let mut pr = github_pr("OPEN", days_ago(5), days_ago(2));
    pr.commits = vec![CommitWithChecks {
        oid: "abc".to_string(),
        committed_date: days_ago(3),
        check_suites: Vec::new(),
        status_contexts: vec![StatusContext {
            context: "ci/build".to_string(),
            state: "SUCCESS".to_string(),
        }],
    }];
    let changeset = changeset_with(HostMetadata::GitHub(pr));

    let status = |state: &str, at| {
        event(
            EventKind::GitHubCommitStatus,
            &format!("{state}:{at}"),
            EventMetadata::GitHubCommitStatus(github::CommitStatus {
                sha: "abc".to_string(),
                context: "ci/build".to_string(),
                state: state.to_string(),
                received_at: at,
            }),
        )
    };

    assert_eq!(derive_state(&changeset, &[]).unwrap().check_state, CheckState::Passed);

    // Older than the sync: already reflected in the snapshot.
    let stale = vec![status("FAILURE", days_ago(4))];
    assert_eq!(derive_state(&changeset, &stale).unwrap().check_state, CheckState::Passed);

    let fresh = vec![status("FAILURE", days_ago(1))];
    assert_eq!(derive_state(&changeset, &fresh).unwrap().check_state, CheckState::Failed);
}

#[test]
fn github_newer_commit_resets_checks() {
    let mut pr = github_pr("OPEN", days_ago(5), days_ago(2));
    pr.commits = vec![CommitWithChecks {
        oid: "abc".to_string(),
        committed_date: days_ago(3),
        check_suites: Vec::new(),
        status_contexts: vec![StatusContext {
            context: "ci/build".to_string(),
            state: "SUCCESS".to_string(),
        }],
    }];
    let changeset = changeset_with(HostMetadata::GitHub(pr));
    let events = vec![event(
        EventKind::GitHubCommit,
        "def",
        EventMetadata::GitHubCommit(github::PullRequestCommit {
            oid: "def".to_string(),
            message: "fixup".to_string(),
            committed_date: days_ago(1),
        }),
    )];
    assert_eq!(derive_state(&changeset, &events).unwrap().check_state, CheckState::Unknown);
}

#[test]
fn queued_check_suite_without_runs_is_ignored() {
    let mut pr = github_pr("OPEN", days_ago(5), days_ago(2));
    pr.commits = vec![CommitWithChecks {
        oid: "abc".to_string(),
        committed_date: days_ago(3),
        check_suites: vec![github::CheckSuite {
            id: "suite-1".to_string(),
            status: "QUEUED".to_string(),
            conclusion: String::new(),
            received_at: days_ago(3),
            check_runs: Vec::new(),
        }],
        status_contexts: vec![StatusContext {
            context: "ci/build".to_string(),
            state: "SUCCESS".to_string(),
        }],
    }];
    let changeset = changeset_with(HostMetadata::GitHub(pr));
    assert_eq!(derive_state(&changeset, &[]).unwrap().check_state, CheckState::Passed);
}

#[test]
fn gitlab_newest_pipeline_decides() {
    let pipeline = |id, status: &str, at| gitlab::Pipeline {
        id,
        status: status.to_string(),
        created_at: at,
    };
    let mr = gitlab::MergeRequest {
        iid: 9,
        title: "Fix license".to_string(),
        description: String::new(),
        state: "opened".to_string(),
        web_url: String::new(),
        source_branch: "campaigns/fix".to_string(),
        target_branch: "main".to_string(),
        created_at: days_ago(5),
        updated_at: days_ago(2),
        notes: Vec::new(),
        pipelines: vec![pipeline(2, "running", days_ago(3)), pipeline(1, "failed", days_ago(4))],
        head_pipeline: None,
    };
    let changeset = changeset_with(HostMetadata::GitLab(mr));
    assert_eq!(derive_state(&changeset, &[]).unwrap().check_state, CheckState::Pending);

    let events = vec![event(
        EventKind::GitLabPipeline,
        "3",
        EventMetadata::GitLabPipeline(pipeline(3, "success", days_ago(1))),
    )];
    assert_eq!(derive_state(&changeset, &events).unwrap().check_state, CheckState::Passed);
}

// ---------------------------------------------------------------------------
// 4. Sync idempotence
// ---------------------------------------------------------------------------

#[test]
fn syncing_twice_stores_the_same_events_and_state() {
    let store = MemoryStore::new();
    let mut pr = github_pr("OPEN", days_ago(5), days_ago(1));
    pr.timeline_items = vec![
        github::TimelineItem::Reviewed(PullRequestReview {
            database_id: 1,
            author: Actor::from("alice"),
            state: "APPROVED".to_string(),
            body: String::new(),
            created_at: days_ago(3),
            updated_at: days_ago(3),
        }),
        github::TimelineItem::Closed(ActorEvent {
            actor: Actor::from("alice"),
            created_at: days_ago(2),
        }),
    ];

    let changeset = store
        .transact(|tx| {
            let mut repo = repo(HostKind::GitHub);
            tx.create_repo(&mut repo)?;
            let mut changeset = Changeset::new_tracked(&repo, "1234", CampaignId(1), now());
            changeset.set_metadata(HostMetadata::GitHub(pr.clone()));
            tx.create_changeset(&mut changeset)?;
            Ok::<_, CoreError>(changeset)
        })
        .expect("seed");

    let sync = |store: &MemoryStore| {
        store
            .transact(|tx| {
                let events = events_from_metadata(&changeset, now());
                tx.upsert_changeset_events(&events)?;
                let stored = tx.list_changeset_events(changeset.id)?;
                let derived = derive_state(&changeset, &stored)?;
                Ok::<_, CoreError>((stored, derived))
            })
            .expect("sync")
    };

    let (first_events, first_state) = sync(&store);
    let (second_events, second_state) = sync(&store);
    assert_eq!(first_events.len(), 2);
    assert_eq!(first_events, second_events);
    assert_eq!(first_state, second_state);
    assert_eq!(first_state.review_state, ReviewState::Approved);
}
