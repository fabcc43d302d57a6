//! The store plus the reconciler, and the operations both the daemon and
//! the CLI run against them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use campaigns_core::{
    Campaign, CampaignId, CampaignSpecFile, Changeset, ChangesetId, ChangesetSyncData, CoreError,
    HostKind, MemoryStore, Repo, RepoId, Store,
};
use campaigns_reconciler::{
    apply_campaign, close_campaign, create_campaign_spec, retry_changeset, ApplyOutcome,
    CommitRequest, GitService, ProcessOutcome, Reconciler, ReconcilerError, SourceSet,
};

use crate::config::EngineConfig;
use crate::error::DaemonError;
use crate::paths::store_path;
use crate::protocol::EngineRequest;
use crate::scheduler::SyncBackend;

/// Git service used when none is registered. Every push fails terminally.
#[derive(Debug, Default)]
pub struct NoGitService;

impl GitService for NoGitService {
    fn create_commit_from_patch(&self, request: &CommitRequest) -> Result<String, ReconcilerError> {
        Err(ReconcilerError::NoPushCredentials {
            repository: request.repository.clone(),
        })
    }
}

/// Row counts reported by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub repos: usize,
    pub campaigns: usize,
    pub open_campaigns: usize,
    pub changesets: usize,
    /// Changesets per reconciler state.
    pub reconciler_states: BTreeMap<String, usize>,
}

pub struct Engine {
    store: Arc<MemoryStore>,
    reconciler: Arc<Reconciler>,
    max_retries: u32,
}

impl Engine {
    pub fn new(store: Arc<MemoryStore>, reconciler: Arc<Reconciler>) -> Self {
        let max_retries = reconciler.config().max_retries;
        Self {
            store,
            reconciler,
            max_retries,
        }
    }

    /// Open the snapshot under `home` with no code hosts registered.
    pub fn open_at(home: &Path, config: &EngineConfig) -> Result<Self, DaemonError> {
        Self::open_with(home, config, SourceSet::new(), Arc::new(NoGitService))
    }

    pub fn open_with(
        home: &Path,
        config: &EngineConfig,
        sources: SourceSet,
        git: Arc<dyn GitService>,
    ) -> Result<Self, DaemonError> {
        let store = MemoryStore::load_at(&store_path(home))?;
        let reconciler = Reconciler::new(sources, git, config.reconciler_config());
        Ok(Self::new(Arc::new(store), Arc::new(reconciler)))
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn flush(&self) -> Result<(), DaemonError> {
        self.store.flush()?;
        Ok(())
    }

    pub fn add_repo(
        &self,
        name: &str,
        host: HostKind,
        external_service_id: Option<String>,
    ) -> Result<Repo, DaemonError> {
        let repo = self.store.transact(|tx| -> Result<Repo, CoreError> {
            let mut repo = Repo {
                id: RepoId(0),
                name: name.to_string(),
                host,
                external_service_id: external_service_id.unwrap_or_else(|| host.to_string()),
            };
            tx.create_repo(&mut repo)?;
            Ok(repo)
        })?;
        tracing::info!("registered repository {} ({})", repo.name, repo.host);
        self.flush()?;
        Ok(repo)
    }

    /// Store `file` as a new campaign spec and apply it.
    pub fn apply(
        &self,
        file: &CampaignSpecFile,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, DaemonError> {
        let spec = create_campaign_spec(&*self.store, file, now)?;
        let outcome = apply_campaign(&*self.store, spec.id, self.max_retries, now)?;
        tracing::info!(
            "applied campaign {} ({} operations)",
            outcome.campaign.name,
            outcome.ops.len()
        );
        self.flush()?;
        Ok(outcome)
    }

    pub fn retry(&self, id: ChangesetId, now: DateTime<Utc>) -> Result<Changeset, DaemonError> {
        let changeset = retry_changeset(&*self.store, id, now)?;
        self.flush()?;
        Ok(changeset)
    }

    pub fn close(
        &self,
        id: CampaignId,
        close_changesets: bool,
        now: DateTime<Utc>,
    ) -> Result<Campaign, DaemonError> {
        let campaign = close_campaign(&*self.store, id, close_changesets, now)?;
        self.flush()?;
        Ok(campaign)
    }

    /// Reconcile one queued changeset, if any is ready.
    pub fn process_next(&self, now: DateTime<Utc>) -> Result<Option<ProcessOutcome>, DaemonError> {
        Ok(self.reconciler.process_next(&*self.store, now)?)
    }

    pub fn summary(&self) -> Result<StoreSummary, DaemonError> {
        let summary = self.store.transact(|tx| -> Result<StoreSummary, CoreError> {
            let campaigns = tx.list_campaigns()?;
            let changesets = tx.list_changesets(&Default::default())?;
            let mut reconciler_states = BTreeMap::new();
            for changeset in &changesets {
                *reconciler_states
                    .entry(changeset.reconciler_state.to_string())
                    .or_insert(0) += 1;
            }
            Ok(StoreSummary {
                repos: tx.list_repos()?.len(),
                open_campaigns: campaigns.iter().filter(|c| !c.is_closed()).count(),
                campaigns: campaigns.len(),
                changesets: changesets.len(),
                reconciler_states,
            })
        })?;
        Ok(summary)
    }

    /// Run one of the store-mutating requests.
    pub fn execute(&self, request: &EngineRequest, now: DateTime<Utc>) -> Result<Value, DaemonError> {
        match request {
            EngineRequest::AddRepo {
                name,
                host,
                external_service_id,
            } => {
                let repo = self.add_repo(name, *host, external_service_id.clone())?;
                Ok(json!(repo))
            }
            EngineRequest::Apply { spec } => Ok(json!(self.apply(spec, now)?)),
            EngineRequest::Retry { changeset } => Ok(json!(self.retry(*changeset, now)?)),
            EngineRequest::Close {
                campaign,
                close_changesets,
            } => Ok(json!(self.close(*campaign, *close_changesets, now)?)),
            other => Err(DaemonError::Protocol(format!(
                "'{}' is not a store operation",
                other.name()
            ))),
        }
    }
}

impl SyncBackend for Engine {
    fn sync_data(&self) -> Result<Vec<ChangesetSyncData>, DaemonError> {
        Ok(self.store.transact(|tx| tx.list_changeset_sync_data())?)
    }

    fn sync_changeset(&self, id: ChangesetId, now: DateTime<Utc>) -> Result<bool, DaemonError> {
        Ok(self.reconciler.sync_changeset(&*self.store, id, now)?)
    }
}
