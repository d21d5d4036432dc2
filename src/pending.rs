//! Pending-start queue: start requests that arrived for a session that was
//! mid-shutdown, replayed once the stop workflow reaches removal.

use std::sync::Arc;

use crate::orchestrator::StartMode;
use crate::state::SessionId;
use crate::unlock::UnlockListener;

pub struct PendingStart {
    pub id: SessionId,
    pub mode: StartMode,
    pub listener: Option<Arc<dyn UnlockListener>>,
}

/// Insertion-ordered queue. Entries are removed when taken for replay, not
/// when the replayed start completes, so a start that gets re-deferred does
/// not loop.
#[derive(Default)]
pub struct PendingStartQueue {
    entries: Vec<PendingStart>,
}

impl PendingStartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PendingStart) {
        tracing::debug!(session = %entry.id, "deferring start until shutdown completes");
        self.entries.push(entry);
    }

    /// Remove and return all entries for `id`, preserving insertion order.
    pub fn take_for(&mut self, id: SessionId) -> Vec<PendingStart> {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.id == id {
                taken.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
