//! Background syncing of published changesets.
//!
//! The scheduler keeps the output of [`build_schedule`] as a queue of
//! deadlines and syncs one changeset whenever the earliest deadline passes.
//! The queue is rebuilt from the store on a fixed interval and whenever
//! [`SyncScheduler::reschedule`] is called. Priority requests bypass the
//! queue; they go through a bounded channel and are dropped, not blocked on,
//! when it is full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use campaigns_core::{ChangesetId, ChangesetSyncData};
use campaigns_reconciler::build_schedule;

use crate::error::{join_err, DaemonError};

/// What the scheduler needs from the store and the reconciler. Both calls
/// block and run on the blocking pool.
pub trait SyncBackend: Send + Sync + 'static {
    fn sync_data(&self) -> Result<Vec<ChangesetSyncData>, DaemonError>;

    /// `Ok(false)` when the changeset was locked and skipped.
    fn sync_changeset(&self, id: ChangesetId, now: DateTime<Utc>) -> Result<bool, DaemonError>;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub recompute_interval: Duration,
    pub priority_capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct Due {
    changeset_id: ChangesetId,
    at: Instant,
}

pub struct SyncScheduler {
    priority_tx: mpsc::Sender<ChangesetId>,
    reschedule_tx: mpsc::Sender<()>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<Result<(), DaemonError>>>>,
}

impl SyncScheduler {
    /// Spawn the scheduler loop. It runs until [`SyncScheduler::stop`] is
    /// called or `shutdown_rx` fires.
    pub fn start(
        backend: Arc<dyn SyncBackend>,
        config: SchedulerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (priority_tx, priority_rx) = mpsc::channel(config.priority_capacity.max(1));
        let (reschedule_tx, reschedule_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler_loop(
            backend,
            config,
            priority_rx,
            reschedule_rx,
            stop_rx,
            shutdown_rx,
        ));
        Self {
            priority_tx,
            reschedule_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue `id` for an immediate sync. Returns `false` if the priority
    /// queue is full or the scheduler has stopped.
    pub fn enqueue_priority(&self, id: ChangesetId) -> bool {
        match self.priority_tx.try_send(id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(changeset = %id, "priority sync queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Rebuild the schedule from the store soon. Requests made while one is
    /// already pending are merged.
    pub fn reschedule(&self) {
        let _ = self.reschedule_tx.try_send(());
    }

    /// Stop the loop and wait for it to exit. Later calls return at once.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        if let Some(stop_tx) = take(&self.stop_tx)? {
            let _ = stop_tx.send(());
        }
        let Some(handle) = take(&self.handle)? else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(join_err("sync_scheduler", err)),
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Result<Option<T>, DaemonError> {
    slot.lock()
        .map(|mut guard| guard.take())
        .map_err(|_| DaemonError::Protocol("scheduler state poisoned".to_string()))
}

async fn scheduler_loop(
    backend: Arc<dyn SyncBackend>,
    config: SchedulerConfig,
    mut priority_rx: mpsc::Receiver<ChangesetId>,
    mut reschedule_rx: mpsc::Receiver<()>,
    mut stop_rx: oneshot::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(config.recompute_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut queue: VecDeque<Due> = VecDeque::new();
    loop {
        let next_due = queue.front().map(|due| due.at);
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if let Some(rebuilt) = recompute(&backend).await? {
                    queue = rebuilt;
                }
            }
            Some(()) = reschedule_rx.recv() => {
                if let Some(rebuilt) = recompute(&backend).await? {
                    queue = rebuilt;
                }
            }
            Some(id) = priority_rx.recv() => {
                sync_one(&backend, id, "priority").await?;
            }
            _ = sleep_until(next_due), if next_due.is_some() => {
                if let Some(due) = queue.pop_front() {
                    sync_one(&backend, due.changeset_id, "scheduled").await?;
                }
            }
        }
    }
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Rebuild the deadline queue from the store, soonest first. `None` when the
/// store could not be read.
async fn recompute(backend: &Arc<dyn SyncBackend>) -> Result<Option<VecDeque<Due>>, DaemonError> {
    let loader = backend.clone();
    let loaded = tokio::task::spawn_blocking(move || {
        let now = loader.now();
        loader.sync_data().map(|data| (now, data))
    })
    .await
    .map_err(|err| join_err("schedule_load", err))?;

    let (now, data) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!(error = %err, "failed to load sync data, keeping previous schedule");
            return Ok(None);
        }
    };

    let base = Instant::now();
    let queue: VecDeque<Due> = build_schedule(now, &data)
        .into_iter()
        .map(|entry| Due {
            changeset_id: entry.changeset_id,
            at: base + (entry.next_sync - now).to_std().unwrap_or(Duration::ZERO),
        })
        .collect();
    tracing::debug!(entries = queue.len(), "sync schedule rebuilt");
    Ok(Some(queue))
}

async fn sync_one(
    backend: &Arc<dyn SyncBackend>,
    id: ChangesetId,
    source: &'static str,
) -> Result<(), DaemonError> {
    let backend = backend.clone();
    let result = tokio::task::spawn_blocking(move || {
        let now = backend.now();
        backend.sync_changeset(id, now)
    })
    .await
    .map_err(|err| join_err("changeset_sync", err))?;

    match result {
        Ok(true) => tracing::info!(changeset = %id, source, "changeset synced"),
        Ok(false) => tracing::debug!(changeset = %id, source, "changeset busy, sync skipped"),
        Err(err) => tracing::warn!(changeset = %id, source, error = %err, "changeset sync failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use tokio::time::advance;

    use campaigns_core::RepoId;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    /// Reports a fixed schedule and records sync calls.
    struct FakeBackend {
        data: Mutex<Vec<ChangesetSyncData>>,
        synced: Mutex<Vec<ChangesetId>>,
    }

    impl FakeBackend {
        fn new(data: Vec<ChangesetSyncData>) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(data),
                synced: Mutex::new(Vec::new()),
            })
        }

        fn synced(&self) -> Vec<ChangesetId> {
            self.synced.lock().unwrap().clone()
        }
    }

    impl SyncBackend for FakeBackend {
        fn sync_data(&self) -> Result<Vec<ChangesetSyncData>, DaemonError> {
            Ok(self.data.lock().unwrap().clone())
        }

        fn sync_changeset(&self, id: ChangesetId, _now: DateTime<Utc>) -> Result<bool, DaemonError> {
            self.synced.lock().unwrap().push(id);
            Ok(true)
        }

        fn now(&self) -> DateTime<Utc> {
            t0()
        }
    }

    /// Synced `minutes_ago` with the last external change `quiet_for` minutes
    /// before that, so the next sync is `quiet_for - minutes_ago` from now.
    fn entry(id: i64, minutes_ago: i64, quiet_for: i64) -> ChangesetSyncData {
        let last_sync = t0() - chrono::Duration::minutes(minutes_ago);
        ChangesetSyncData {
            changeset_id: ChangesetId(id),
            repo_id: RepoId(1),
            updated_at: Some(last_sync),
            latest_event: None,
            external_updated_at: Some(last_sync - chrono::Duration::minutes(quiet_for)),
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            recompute_interval: Duration::from_secs(3600),
            priority_capacity: 2,
        }
    }

    /// Let the loop and its blocking calls run. Paused time does not
    /// auto-advance while a blocking task is in flight.
    async fn settle() {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn syncs_in_deadline_order() {
        // Due in 10 minutes, and in 3 minutes.
        let backend = FakeBackend::new(vec![entry(1, 0, 10), entry(2, 0, 3)]);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::start(backend.clone(), config(), shutdown_rx);
        settle().await;
        assert!(backend.synced().is_empty());

        advance(Duration::from_secs(4 * 60)).await;
        settle().await;
        assert_eq!(backend.synced(), vec![ChangesetId(2)]);

        advance(Duration::from_secs(7 * 60)).await;
        settle().await;
        assert_eq!(backend.synced(), vec![ChangesetId(2), ChangesetId(1)]);

        scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn priority_requests_skip_the_queue() {
        let backend = FakeBackend::new(vec![entry(1, 0, 60)]);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::start(backend.clone(), config(), shutdown_rx);
        settle().await;

        assert!(scheduler.enqueue_priority(ChangesetId(9)));
        settle().await;
        assert_eq!(backend.synced(), vec![ChangesetId(9)]);
        scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn full_priority_queue_drops_requests() {
        let backend = FakeBackend::new(Vec::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::start(backend.clone(), config(), shutdown_rx);

        // The loop has not run yet, so nothing is drained.
        assert!(scheduler.enqueue_priority(ChangesetId(1)));
        assert!(scheduler.enqueue_priority(ChangesetId(2)));
        assert!(!scheduler.enqueue_priority(ChangesetId(3)));

        settle().await;
        assert_eq!(backend.synced(), vec![ChangesetId(1), ChangesetId(2)]);
        scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn reschedule_picks_up_new_entries() {
        let backend = FakeBackend::new(Vec::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::start(backend.clone(), config(), shutdown_rx);
        settle().await;

        // Never synced: due immediately once the schedule is rebuilt.
        backend.data.lock().unwrap().push(ChangesetSyncData {
            changeset_id: ChangesetId(4),
            repo_id: RepoId(1),
            updated_at: None,
            latest_event: None,
            external_updated_at: None,
        });
        scheduler.reschedule();
        settle().await;
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(backend.synced(), vec![ChangesetId(4)]);
        scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_broadcast_stops_the_loop() {
        let backend = FakeBackend::new(Vec::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::start(backend, config(), shutdown_rx);
        settle().await;
        let _ = shutdown_tx.send(());
        scheduler.stop().await.expect("stop");
    }
}
