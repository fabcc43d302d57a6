//! Error types for campaigns-reconciler.

use thiserror::Error;

use campaigns_core::{CoreError, HostKind, RepoId};

/// All errors that can arise from rewiring and reconciling.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// An error from the data model or the store.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Another changeset already owns the head branch in this repository.
    #[error("cannot create changeset on the same branch in multiple campaigns")]
    PublishSameBranch,

    /// The git service failed to turn the diff into a commit.
    #[error(
        "creating commit from patch for repository {repository:?}: {message}\n```\n$ {command}\n{combined_output}\n```"
    )]
    DiffApply {
        repository: String,
        message: String,
        command: String,
        combined_output: String,
    },

    /// Transport or server failure from the git service.
    #[error("git service: {0}")]
    Git(String),

    /// Transport or server failure from a code host.
    #[error("code host: {0}")]
    Host(String),

    /// The code host no longer knows the changeset.
    #[error("changeset {external_id} not found on code host")]
    ChangesetNotFound { external_id: String },

    /// No source is configured for the repository's code host.
    #[error("no valid credential for {host} repository {repository:?}")]
    MissingCredentials { host: HostKind, repository: String },

    /// No git service can push to the repository.
    #[error("cannot use credentials for repository {repository:?} to push")]
    NoPushCredentials { repository: String },

    /// A spec references a repository the caller cannot see.
    #[error("repository {0} not found or not accessible")]
    RepoNotFound(RepoId),

    #[error("repository {0:?} is not registered")]
    UnknownRepository(String),

    #[error("cannot apply to closed campaign {0:?}")]
    ApplyClosedCampaign(String),

    /// Two changeset specs of one apply match the same changeset.
    #[error("changeset specs {0} and {1} both match changeset {2}")]
    DuplicateSpec(String, String, String),
}

impl ReconcilerError {
    /// Whether retrying the same action can succeed.
    ///
    /// Conflicts and bugs are terminal; transport failures and store
    /// contention are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcilerError::Core(CoreError::InvariantViolation(_)) => false,
            ReconcilerError::Core(CoreError::InvalidInput(_)) => false,
            ReconcilerError::Core(_) => true,
            ReconcilerError::PublishSameBranch => false,
            ReconcilerError::DiffApply { combined_output, .. } => {
                !combined_output.contains("patch does not apply")
            }
            ReconcilerError::Git(_) | ReconcilerError::Host(_) => true,
            ReconcilerError::ChangesetNotFound { .. } => true,
            ReconcilerError::MissingCredentials { .. } => false,
            ReconcilerError::NoPushCredentials { .. } => false,
            ReconcilerError::RepoNotFound(_) => false,
            ReconcilerError::UnknownRepository(_) => false,
            ReconcilerError::ApplyClosedCampaign(_) => false,
            ReconcilerError::DuplicateSpec(..) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReconcilerError::ChangesetNotFound { .. }
                | ReconcilerError::Core(CoreError::NotFound { .. })
        )
    }
}
