//! Changeset row locks.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::CoreError;
use crate::types::ChangesetId;

/// Set of changeset ids currently held, with a condition variable signalled
/// whenever locks are released.
#[derive(Debug, Default)]
pub struct RowLocks {
    held: Mutex<HashSet<ChangesetId>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn held(&self) -> Result<MutexGuard<'_, HashSet<ChangesetId>>, CoreError> {
        self.held.lock().map_err(|_| CoreError::Poisoned("row locks"))
    }

    pub fn is_locked(&self, id: ChangesetId) -> Result<bool, CoreError> {
        Ok(self.held()?.contains(&id))
    }

    pub fn try_lock(&self, id: ChangesetId) -> Result<Option<RowLockGuard<'_>>, CoreError> {
        let mut held = self.held()?;
        if !held.insert(id) {
            return Ok(None);
        }
        Ok(Some(RowLockGuard::new(self, vec![id])))
    }

    /// Lock all of `ids`, blocking until none of them is held elsewhere.
    /// Locks are taken all at once so two waiters cannot deadlock on
    /// overlapping sets.
    pub fn lock_all(&self, ids: Vec<ChangesetId>) -> Result<RowLockGuard<'_>, CoreError> {
        let mut held = self.held()?;
        while ids.iter().any(|id| held.contains(id)) {
            held = self
                .released
                .wait(held)
                .map_err(|_| CoreError::Poisoned("row locks"))?;
        }
        held.extend(ids.iter().copied());
        Ok(RowLockGuard::new(self, ids))
    }

    /// Mark `id` held while the caller already owns the set. Used by the
    /// store while it holds its table mutex.
    pub(crate) fn claim<'a>(
        &'a self,
        held: &mut HashSet<ChangesetId>,
        id: ChangesetId,
    ) -> RowLockGuard<'a> {
        held.insert(id);
        RowLockGuard::new(self, vec![id])
    }

    fn release(&self, ids: &[ChangesetId]) {
        // A poisoned set still has to let the other holders go.
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for id in ids {
            held.remove(id);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Releases its changesets on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RowLockGuard<'a> {
    locks: &'a RowLocks,
    ids: Vec<ChangesetId>,
}

impl<'a> RowLockGuard<'a> {
    fn new(locks: &'a RowLocks, ids: Vec<ChangesetId>) -> Self {
        Self { locks, ids }
    }

    pub fn ids(&self) -> &[ChangesetId] {
        &self.ids
    }
}

impl Drop for RowLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.ids);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn try_lock_is_exclusive_until_drop() {
        let locks = RowLocks::new();
        let guard = locks.try_lock(ChangesetId(1)).unwrap().unwrap();
        assert!(locks.try_lock(ChangesetId(1)).unwrap().is_none());
        assert!(locks.try_lock(ChangesetId(2)).unwrap().is_some());
        drop(guard);
        assert!(locks.try_lock(ChangesetId(1)).unwrap().is_some());
    }

    #[test]
    fn lock_all_waits_for_holder() {
        let locks = Arc::new(RowLocks::new());
        let guard = locks.try_lock(ChangesetId(7)).unwrap().unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let guard = locks.lock_all(vec![ChangesetId(6), ChangesetId(7)]).unwrap();
                guard.ids().to_vec()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(guard);

        let ids = waiter.join().unwrap();
        assert_eq!(ids, vec![ChangesetId(6), ChangesetId(7)]);
        assert!(!locks.is_locked(ChangesetId(7)).unwrap());
    }
}
