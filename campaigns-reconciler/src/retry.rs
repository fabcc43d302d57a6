//! Retry bookkeeping for failed reconciler actions.

use chrono::{DateTime, Duration, Utc};

use campaigns_core::{Changeset, ReconcilerState};

use crate::error::ReconcilerError;

const BASE_BACKOFF_SECS: i64 = 10;
const MAX_BACKOFF_SECS: i64 = 30 * 60;

/// Delay before the `num_failures`-th retry: 10s doubling per failure,
/// capped at 30 minutes.
pub fn backoff(num_failures: u32) -> Duration {
    let exponent = num_failures.saturating_sub(1).min(20);
    let secs = BASE_BACKOFF_SECS.saturating_mul(1_i64 << exponent);
    Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

/// Record a failed attempt. Terminal errors push the changeset straight to
/// the retry ceiling so the worker query skips it.
pub fn mark_errored(
    changeset: &mut Changeset,
    err: &ReconcilerError,
    max_retries: u32,
    now: DateTime<Utc>,
) {
    changeset.reconciler_state = ReconcilerState::Errored;
    changeset.failure_message = Some(err.to_string());
    changeset.updated_at = now;
    if err.is_retryable() {
        changeset.num_failures = changeset.num_failures.saturating_add(1);
        changeset.process_after = Some(now + backoff(changeset.num_failures));
    } else {
        changeset.num_failures = changeset.num_failures.max(max_retries);
        changeset.process_after = None;
    }
}
