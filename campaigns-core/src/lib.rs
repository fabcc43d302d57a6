//! Campaigns core library: domain types, host metadata, event normalization,
//! state derivation, and the store.
//!
//! - [`types`]: ids, campaigns, specs, changesets
//! - [`metadata`]: per-host pull request payloads
//! - [`events`] / [`normalize`]: canonical changeset events
//! - [`state`]: history, external/review/check state
//! - [`store`]: transactional store trait, in-memory store, JSON snapshot
//! - [`spec_file`]: campaign spec YAML

pub mod error;
pub mod events;
pub mod metadata;
pub mod normalize;
pub mod spec_file;
pub mod state;
pub mod store;
pub mod types;

pub use error::CoreError;
pub use events::{ChangesetEvent, EventKind, EventMetadata};
pub use metadata::HostMetadata;
pub use normalize::{events_from_metadata, normalize_webhook, WebhookPayload};
pub use spec_file::CampaignSpecFile;
pub use state::{apply_derived_state, compute_history, derive_state, state_at, DerivedState, StatesAtTime};
pub use store::{ChangesetSyncData, ListChangesetsOpts, MemoryStore, Store, StoreTx};
pub use types::{
    BranchChange, Campaign, CampaignId, CampaignSpec, CampaignSpecId, Changeset, ChangesetId,
    ChangesetSpec, ChangesetSpecDescription, ChangesetSpecId, CheckState, ExternalState,
    GitCommitDescription, HostKind, Namespace, PublicationState, ReconcilerState, Repo, RepoId,
    ReviewState,
};
