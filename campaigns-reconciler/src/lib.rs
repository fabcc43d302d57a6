//! # campaigns-reconciler
//!
//! Rewiring and reconciliation of campaign changesets.
//!
//! Call [`apply_campaign`] to match a stored campaign spec against the
//! campaign's changesets, then drive each queued changeset to its desired
//! state with [`Reconciler::process_next`]. [`schedule`] computes when
//! published changesets should be synced again.

pub mod error;
pub mod executor;
pub mod plan;
pub mod retry;
pub mod rewirer;
pub mod schedule;
pub mod service;
pub mod sources;

pub use error::ReconcilerError;
pub use executor::{ProcessOutcome, Reconciler, ReconcilerConfig};
pub use plan::{determine_action, Action, ChangesetDelta, Plan};
pub use rewirer::{AppliedOp, Operation, RewirePlan};
pub use schedule::{build_schedule, next_sync, ScheduledSync};
pub use service::{
    apply_campaign, close_campaign, create_campaign_spec, retry_changeset, ApplyKind, ApplyOutcome,
};
pub use sources::{ChangesetDraft, ChangesetSource, CommitInfo, CommitRequest, GitService, SourceSet};
