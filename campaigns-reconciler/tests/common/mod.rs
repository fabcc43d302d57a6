//! In-memory code host and git service shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use campaigns_core::{
    metadata::github::{self, Actor, ActorEvent},
    spec_file::{ChangesetTemplate, TemplateChange},
    types::abbreviate_ref,
    BranchChange, CampaignSpecFile, Changeset, CoreError, GitCommitDescription, HostKind,
    HostMetadata, MemoryStore, Namespace, Repo, RepoId, Store,
};
use campaigns_reconciler::{
    ChangesetDraft, ChangesetSource, CommitRequest, GitService, Reconciler, ReconcilerConfig,
    ReconcilerError, SourceSet,
};

pub const MAX_RETRIES: u32 = 5;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).single().expect("fixed now")
}

// ---------------------------------------------------------------------------
// Fake code host
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HostState {
    prs: HashMap<String, github::PullRequest>,
    next_number: i64,
    calls: Vec<String>,
    fail_with: Option<String>,
}

/// A GitHub-like host keeping pull requests in memory.
pub struct FakeSource {
    now: DateTime<Utc>,
    state: Mutex<HostState>,
}

impl FakeSource {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now,
            state: Mutex::new(HostState {
                next_number: 100,
                ..Default::default()
            }),
        })
    }

    /// Open a pull request on the host directly.
    pub fn seed_pr(&self, number: i64, head_ref: &str, title: &str) -> github::PullRequest {
        let pr = github::PullRequest {
            number,
            title: title.to_string(),
            body: String::new(),
            state: "OPEN".to_string(),
            url: format!("https://github.com/acme/api/pull/{number}"),
            head_ref_name: head_ref.to_string(),
            base_ref_name: "main".to_string(),
            head_ref_oid: String::new(),
            is_draft: false,
            created_at: self.now,
            updated_at: self.now,
            timeline_items: Vec::new(),
            commits: Vec::new(),
        };
        self.lock().prs.insert(number.to_string(), pr.clone());
        pr
    }

    /// Close a pull request on the host, outside any campaign.
    pub fn close_pr(&self, number: i64) {
        let mut state = self.lock();
        if let Some(pr) = state.prs.get_mut(&number.to_string()) {
            pr.state = "CLOSED".to_string();
            pr.updated_at = self.now;
            pr.timeline_items.push(github::TimelineItem::Closed(ActorEvent {
                actor: Actor::from("octocat"),
                created_at: self.now,
            }));
        }
    }

    pub fn delete_pr(&self, number: i64) {
        self.lock().prs.remove(&number.to_string());
    }

    pub fn pr(&self, number: &str) -> Option<github::PullRequest> {
        self.lock().prs.get(number).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn fail_next_calls(&self, message: &str) {
        self.lock().fail_with = Some(message.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("host state")
    }

    fn record(&self, call: &str) -> Result<std::sync::MutexGuard<'_, HostState>, ReconcilerError> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        if let Some(message) = state.fail_with.clone() {
            return Err(ReconcilerError::Host(message));
        }
        Ok(state)
    }

    fn external_id(changeset: &Changeset) -> Result<String, ReconcilerError> {
        changeset
            .external_id
            .clone()
            .ok_or_else(|| ReconcilerError::Host("changeset has no external id".to_string()))
    }
}

impl ChangesetSource for FakeSource {
    fn create_changeset(&self, draft: &mut ChangesetDraft<'_>) -> Result<bool, ReconcilerError> {
        let mut state = self.record("create")?;
        let head = abbreviate_ref(&draft.head_ref).to_string();
        if let Some(existing) = state.prs.values().find(|pr| pr.head_ref_name == head) {
            draft.changeset.set_metadata(HostMetadata::GitHub(existing.clone()));
            return Ok(true);
        }
        let number = state.next_number;
        state.next_number += 1;
        let pr = github::PullRequest {
            number,
            title: draft.title.clone(),
            body: draft.body.clone(),
            state: "OPEN".to_string(),
            url: String::new(),
            head_ref_name: head,
            base_ref_name: abbreviate_ref(&draft.base_ref).to_string(),
            head_ref_oid: String::new(),
            is_draft: false,
            created_at: self.now,
            updated_at: self.now,
            timeline_items: Vec::new(),
            commits: Vec::new(),
        };
        state.prs.insert(number.to_string(), pr.clone());
        draft.changeset.set_metadata(HostMetadata::GitHub(pr));
        Ok(false)
    }

    fn update_changeset(&self, draft: &mut ChangesetDraft<'_>) -> Result<(), ReconcilerError> {
        let mut state = self.record("update")?;
        let id = Self::external_id(&*draft.changeset)?;
        let pr = state
            .prs
            .get_mut(&id)
            .ok_or_else(|| ReconcilerError::ChangesetNotFound { external_id: id.clone() })?;
        pr.title = draft.title.clone();
        pr.body = draft.body.clone();
        pr.base_ref_name = abbreviate_ref(&draft.base_ref).to_string();
        pr.updated_at = self.now;
        draft.changeset.set_metadata(HostMetadata::GitHub(pr.clone()));
        Ok(())
    }

    fn close_changeset(&self, _repo: &Repo, changeset: &mut Changeset) -> Result<(), ReconcilerError> {
        let mut state = self.record("close")?;
        let id = Self::external_id(changeset)?;
        let pr = state
            .prs
            .get_mut(&id)
            .ok_or_else(|| ReconcilerError::ChangesetNotFound { external_id: id.clone() })?;
        pr.state = "CLOSED".to_string();
        pr.updated_at = self.now;
        pr.timeline_items.push(github::TimelineItem::Closed(ActorEvent {
            actor: Actor::from("campaigns-bot"),
            created_at: self.now,
        }));
        changeset.set_metadata(HostMetadata::GitHub(pr.clone()));
        Ok(())
    }

    fn load_changeset(&self, _repo: &Repo, changeset: &mut Changeset) -> Result<(), ReconcilerError> {
        let state = self.record("load")?;
        let id = Self::external_id(changeset)?;
        let pr = state
            .prs
            .get(&id)
            .ok_or(ReconcilerError::ChangesetNotFound { external_id: id.clone() })?;
        changeset.set_metadata(HostMetadata::GitHub(pr.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake git service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeGit {
    requests: Mutex<Vec<CommitRequest>>,
    failure: Mutex<Option<String>>,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<CommitRequest> {
        self.requests.lock().expect("requests").clone()
    }

    /// Make every following commit fail with `output` as the git output.
    pub fn fail_with(&self, output: &str) {
        *self.failure.lock().expect("failure") = Some(output.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().expect("failure") = None;
    }
}

impl GitService for FakeGit {
    fn create_commit_from_patch(&self, request: &CommitRequest) -> Result<String, ReconcilerError> {
        self.requests.lock().expect("requests").push(request.clone());
        if let Some(output) = self.failure.lock().expect("failure").clone() {
            return Err(ReconcilerError::DiffApply {
                repository: request.repository.clone(),
                message: "exit status 1".to_string(),
                command: "git apply -p0 --cached -".to_string(),
                combined_output: output,
            });
        }
        Ok(request.target_ref.clone())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: MemoryStore,
    pub source: Arc<FakeSource>,
    pub git: Arc<FakeGit>,
    pub reconciler: Reconciler,
    pub repo: Repo,
}

impl Harness {
    pub fn new() -> Self {
        init_logging();
        let store = MemoryStore::new();
        let repo = add_repo(&store, "github.com/acme/api", HostKind::GitHub);
        let source = FakeSource::new(now());
        let git = FakeGit::new();
        let sources = SourceSet::new().with(HostKind::GitHub, source.clone());
        let reconciler = Reconciler::new(
            sources,
            git.clone(),
            ReconcilerConfig {
                max_retries: MAX_RETRIES,
                sleep_before_sync: Duration::ZERO,
            },
        );
        Self {
            store,
            source,
            git,
            reconciler,
            repo,
        }
    }

    pub fn changeset(&self, id: campaigns_core::ChangesetId) -> Changeset {
        self.store
            .transact(|tx| tx.get_changeset(id))
            .expect("get changeset")
    }

    pub fn all_changesets(&self) -> Vec<Changeset> {
        self.store
            .transact(|tx| tx.list_changesets(&Default::default()))
            .expect("list changesets")
    }
}

pub fn add_repo(store: &MemoryStore, name: &str, host: HostKind) -> Repo {
    store
        .transact(|tx| {
            let mut repo = Repo {
                id: RepoId(0),
                name: name.to_string(),
                host,
                external_service_id: host.to_string(),
            };
            tx.create_repo(&mut repo)?;
            Ok::<_, CoreError>(repo)
        })
        .expect("create repo")
}

pub fn branch(head_ref: &str, title: &str, diff: &str, published: Option<bool>) -> BranchChange {
    BranchChange {
        base_ref: "main".to_string(),
        base_rev: "4f2a1c".to_string(),
        head_ref: head_ref.to_string(),
        title: title.to_string(),
        body: "Automated change.".to_string(),
        commits: vec![GitCommitDescription {
            message: "Add license header".to_string(),
            diff: diff.to_string(),
            author_name: Some("Campaigns Bot".to_string()),
            author_email: Some("bot@example.com".to_string()),
        }],
        published,
    }
}

pub fn spec_file(changes: Vec<(&str, TemplateChange)>) -> CampaignSpecFile {
    CampaignSpecFile {
        name: "fix-license".to_string(),
        description: "Add the missing license header".to_string(),
        namespace: Namespace::User("alice".to_string()),
        author: None,
        changesets: changes
            .into_iter()
            .map(|(repository, change)| ChangesetTemplate {
                repository: repository.to_string(),
                change,
            })
            .collect(),
    }
}

pub fn branch_file(repository: &str, change: BranchChange) -> CampaignSpecFile {
    spec_file(vec![(repository, TemplateChange::Branch(change))])
}

pub fn empty_file() -> CampaignSpecFile {
    spec_file(Vec::new())
}

/// Branch names used by more than one changeset.
pub fn duplicate_branches(changesets: &[Changeset]) -> HashSet<String> {
    let mut seen = HashSet::new();
    changesets
        .iter()
        .filter_map(|c| c.external_branch.clone())
        .filter(|b| !seen.insert(b.clone()))
        .collect()
}
