//! When each changeset should next be synced from its code host.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use campaigns_core::{ChangesetId, ChangesetSyncData, RepoId};

pub fn min_sync_delay() -> Duration {
    Duration::minutes(2)
}

pub fn max_sync_delay() -> Duration {
    Duration::hours(8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledSync {
    pub changeset_id: ChangesetId,
    pub repo_id: RepoId,
    pub next_sync: DateTime<Utc>,
}

/// Next sync time for one changeset.
///
/// Changesets that changed recently are synced again soon; quiet ones back
/// off to [`max_sync_delay`]. An event that arrived close to the last sync
/// was most likely produced by it and does not count as activity.
pub fn next_sync(now: DateTime<Utc>, data: &ChangesetSyncData) -> DateTime<Utc> {
    let Some(last_sync) = data.updated_at else {
        return now;
    };

    let external = data.external_updated_at.unwrap_or(last_sync);
    let last_change = match data.latest_event {
        Some(event) if within_min_delay(event - last_sync) => external,
        Some(event) => external.max(event),
        None => external,
    };

    let diff = last_sync - last_change;
    if diff < Duration::zero() {
        return last_change + min_sync_delay();
    }
    last_sync + diff.clamp(min_sync_delay(), max_sync_delay())
}

fn within_min_delay(gap: Duration) -> bool {
    gap < min_sync_delay() && -gap < min_sync_delay()
}

/// Sync times for `data`, soonest first.
pub fn build_schedule(now: DateTime<Utc>, data: &[ChangesetSyncData]) -> Vec<ScheduledSync> {
    let mut schedule: Vec<ScheduledSync> = data
        .iter()
        .map(|d| ScheduledSync {
            changeset_id: d.changeset_id,
            repo_id: d.repo_id,
            next_sync: next_sync(now, d),
        })
        .collect();
    schedule.sort_by_key(|s| (s.next_sync, s.changeset_id));
    schedule
}
