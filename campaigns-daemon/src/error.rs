use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the engine runtime, its config, and the socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse engine config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("store error: {0}")]
    Core(#[from] campaigns_core::CoreError),

    #[error("{0}")]
    Reconciler(#[from] campaigns_reconciler::ReconcilerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{task} task join failure: {source}")]
    Join {
        task: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn join_err(task: impl Into<String>, source: tokio::task::JoinError) -> DaemonError {
    DaemonError::Join {
        task: task.into(),
        source,
    }
}
