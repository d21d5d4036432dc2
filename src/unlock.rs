//! Unlock workflow: storage key unlock, the `RunningLocked -> Unlocking ->
//! Unlocked` march, listener notification, the pre-boot sequence, and the
//! parent-to-profile cascade.

use std::sync::Arc;

use crate::journey::JourneyKind;
use crate::orchestrator::Orchestrator;
use crate::registry::BeginUnlock;
use crate::services::{AccountInfo, LifecycleEvent};
use crate::state::{SessionId, SessionState, SessionToken};

/// Observer of one session's unlock progress.
///
/// Every listener receives exactly one `on_finished`, even when the unlock
/// bails out before doing any work. Listeners registered while an unlock is
/// already in flight ride along on the same workflow.
pub trait UnlockListener: Send + Sync {
    /// The workflow has begun for this session.
    fn on_started(&self, _id: SessionId) {}

    /// Coarse progress milestones, in percent.
    fn on_progress(&self, _id: SessionId, _percent: u32) {}

    /// Terminal notification. `unlocked` is false when the session stays
    /// locked (storage failure, locked parent, or a racing stop).
    fn on_finished(&self, id: SessionId, unlocked: bool);
}

impl Orchestrator {
    /// Attempt to unlock `id`, riding along on an in-flight attempt when
    /// one exists. Returns true if the session ends (or already is)
    /// unlocked from this workflow's point of view.
    pub async fn unlock(&self, id: SessionId, listener: Option<Arc<dyn UnlockListener>>) -> bool {
        match self.inner.registry.begin_unlock(id, listener.clone()) {
            BeginUnlock::NotFound => {
                tracing::debug!(session = %id, "unlock refused: not started");
                if let Some(l) = listener {
                    l.on_finished(id, false);
                }
                false
            }
            BeginUnlock::NotUnlockable => {
                // Not RunningLocked, or the parent is still locked. The
                // parent's cascade retries profiles later.
                tracing::debug!(session = %id, "unlock not possible now");
                if let Some(l) = listener {
                    l.on_finished(id, false);
                }
                false
            }
            BeginUnlock::AlreadyUnlocked => {
                if let Some(l) = listener {
                    l.on_finished(id, true);
                }
                true
            }
            BeginUnlock::InFlight => {
                // The listener (if any) was attached to the in-flight
                // workflow and will hear from it.
                true
            }
            BeginUnlock::Ready { token, info } => self.drive_unlock(id, token, info).await,
        }
    }

    /// Fire-and-forget unlock attempt.
    pub fn spawn_unlock(&self, id: SessionId, listener: Option<Arc<dyn UnlockListener>>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.unlock(id, listener).await;
        });
    }

    async fn drive_unlock(&self, id: SessionId, token: SessionToken, info: AccountInfo) -> bool {
        self.inner.journeys.begin(JourneyKind::Unlock, id);
        for waiter in self.inner.registry.unlock_waiters(id, &token) {
            waiter.on_started(id);
        }

        if !self.inner.storage.is_unlocked(id) {
            if let Err(err) = self.inner.storage.unlock(id).await {
                // Failure is not fatal to the session; it just stays locked.
                tracing::warn!(session = %id, %err, "storage unlock failed; session stays locked");
                self.finish_unlock(id, &token, false);
                return false;
            }
        }
        self.notify_progress(id, &token, 20);

        if !self.inner.registry.transition(
            id,
            &token,
            SessionState::RunningLocked,
            SessionState::Unlocking,
        ) {
            self.finish_unlock(id, &token, false);
            return false;
        }
        if let Err(err) = self
            .inner
            .broadcasts
            .send_ordered(LifecycleEvent::Unlocking(id))
            .await
        {
            tracing::warn!(session = %id, %err, "unlocking broadcast failed");
        }

        self.notify_progress(id, &token, 80);

        if !self.inner.registry.transition(
            id,
            &token,
            SessionState::Unlocking,
            SessionState::Unlocked,
        ) {
            self.finish_unlock(id, &token, false);
            return false;
        }
        tracing::info!(session = %id, "session unlocked");
        self.inner.broadcasts.send(LifecycleEvent::Unlocked(id));
        if let Some(parent) = info.parent {
            self.inner.broadcasts.send(LifecycleEvent::ProfileUnlocked {
                profile: id,
                parent,
            });
        }
        // Pre-boot runs once the session is visibly unlocked; only the
        // journey completion waits for it.
        if self.needs_pre_boot(&info) {
            self.run_pre_boot(id).await;
        }
        self.finish_unlock(id, &token, true);

        // Profiles that were waiting on this parent can unlock now.
        for child in self.inner.registry.children_to_cascade(id) {
            self.spawn_unlock(child, None);
        }
        true
    }

    /// One-shot sequence before the first unlock on a new platform build.
    async fn run_pre_boot(&self, id: SessionId) {
        tracing::info!(session = %id, fingerprint = %self.inner.config.build_fingerprint, "running pre-boot sequence");
        if let Err(err) = self
            .inner
            .broadcasts
            .send_ordered(LifecycleEvent::PreBoot(id))
            .await
        {
            tracing::warn!(session = %id, %err, "pre-boot broadcast failed");
        }
        self.inner
            .accounts
            .set_last_fingerprint(id, &self.inner.config.build_fingerprint);
    }

    fn needs_pre_boot(&self, info: &AccountInfo) -> bool {
        if self.inner.config.force_pre_boot {
            return true;
        }
        let current = &self.inner.config.build_fingerprint;
        !current.is_empty() && info.last_fingerprint.as_deref() != Some(current.as_str())
    }

    fn notify_progress(&self, id: SessionId, token: &SessionToken, percent: u32) {
        for waiter in self.inner.registry.unlock_waiters(id, token) {
            waiter.on_progress(id, percent);
        }
    }

    /// Deliver the terminal notification to every waiter, exactly once.
    fn finish_unlock(&self, id: SessionId, token: &SessionToken, unlocked: bool) {
        let waiters = self.inner.registry.finish_unlock(id, token);
        for waiter in waiters {
            waiter.on_finished(id, unlocked);
        }
        self.inner.journeys.end(JourneyKind::Unlock, id);
    }
}
