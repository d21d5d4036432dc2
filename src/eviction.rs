//! Delayed-locking eviction policy.
//!
//! An LRU cache over storage-unlock state: stopped sessions may keep their
//! storage key warm, up to a global budget of `max_unlocked` counting both
//! running sessions and warm entries. Eviction is triggered only at stop
//! time and evicts the least-recently-stopped warm entry, which is not
//! necessarily the session that triggered the check.

use std::collections::VecDeque;

use crate::state::SessionId;

/// Warm list, most-recently-stopped at the front. Owned by the registry
/// and mutated only under the registry mutex.
#[derive(Debug, Default)]
pub struct DelayedLockingPolicy {
    last_active: VecDeque<SessionId>,
}

impl DelayedLockingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session started (or restarted): it is no longer a warm stopped
    /// entry.
    pub fn note_started(&mut self, id: SessionId) {
        self.last_active.retain(|&w| w != id);
    }

    /// Decide which session's storage to lock now that `id` has finished
    /// stopping.
    ///
    /// `keep_warm` is the caller's policy verdict for `id` (delayed locking
    /// enabled, not ephemeral, not restricted, caller allowed the delay).
    /// `running` is the number of currently running sessions, recomputed
    /// fresh by the caller at every stop.
    ///
    /// Returns the id whose key must be locked, or `None` to lock nobody.
    pub fn on_stopped(
        &mut self,
        id: SessionId,
        keep_warm: bool,
        running: usize,
        max_unlocked: usize,
    ) -> Option<SessionId> {
        self.last_active.retain(|&w| w != id);
        if !keep_warm {
            return Some(id);
        }
        self.last_active.push_front(id);
        if running + self.last_active.len() > max_unlocked {
            let coldest = self.last_active.pop_back();
            tracing::debug!(
                evicted = ?coldest,
                warm = self.last_active.len(),
                running,
                max_unlocked,
                "delayed-locking budget exceeded"
            );
            coldest
        } else {
            None
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.last_active.contains(&id)
    }

    pub fn warm_ids(&self) -> Vec<SessionId> {
        self.last_active.iter().copied().collect()
    }

    pub fn warm_len(&self) -> usize {
        self.last_active.len()
    }
}
