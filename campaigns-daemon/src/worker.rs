//! Reconciler workers. Each one polls the store for queued changesets and
//! drains them one at a time on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use campaigns_reconciler::ProcessOutcome;

use crate::engine::Engine;
use crate::error::{join_err, DaemonError};

/// Counters shown by `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ProcessOutcome, at: DateTime<Utc>) {
        self.processed += 1;
        self.last_processed_at = Some(at);
        if let Some(error) = &outcome.error {
            self.failed += 1;
            self.last_error = Some(format!("changeset {}: {error}", outcome.changeset_id));
        }
    }
}

pub async fn worker_task(
    index: usize,
    engine: Arc<Engine>,
    stats: Arc<RwLock<WorkerStats>>,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                loop {
                    let now = Utc::now();
                    let worker_engine = engine.clone();
                    let result = tokio::task::spawn_blocking(move || worker_engine.process_next(now))
                        .await
                        .map_err(|err| join_err(format!("worker_{index}"), err))?;
                    match result {
                        Ok(Some(outcome)) => {
                            log_outcome(index, &outcome);
                            stats.write().await.record(&outcome, now);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::error!(worker = index, error = %err, "reconciler store failure");
                            break;
                        }
                    }
                    if !matches!(
                        shutdown_rx.try_recv(),
                        Err(broadcast::error::TryRecvError::Empty)
                    ) {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn log_outcome(index: usize, outcome: &ProcessOutcome) {
    let action = outcome.action.as_ref().map_or("none", |a| a.name());
    match &outcome.error {
        None => tracing::info!(
            worker = index,
            changeset = %outcome.changeset_id,
            action,
            "changeset reconciled",
        ),
        Some(error) => tracing::warn!(
            worker = index,
            changeset = %outcome.changeset_id,
            action,
            error = %error,
            "changeset reconcile failed",
        ),
    }
}
