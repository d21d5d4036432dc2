//! Stop workflow: the two-phase `Stopping -> Shutdown -> removed` drain,
//! completion callbacks, ephemeral account removal, storage key eviction,
//! and the replay of starts that raced the stop.

use crate::orchestrator::Orchestrator;
use crate::registry::{StopPlan, StopTicket};
use crate::services::{AccountInfo, LifecycleEvent};
use crate::state::{SessionId, SessionToken};

/// Terminal result delivered to a stop callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The session ran through the drain and was removed.
    Stopped,
    /// The session was not started when the request arrived.
    AlreadyStopped,
}

/// Completion callback for one stop request. Fires exactly once.
pub type StopCallback = Box<dyn FnOnce(SessionId, StopOutcome) + Send>;

/// Fires when the session's storage key is finally evicted, which under
/// delayed locking may be long after the stop completed, and may name a
/// different (colder) session.
pub type KeyEvictedCallback = Box<dyn FnOnce(SessionId) + Send>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StopError {
    #[error("the system session cannot be stopped")]
    System,
    #[error("the foreground session cannot be stopped")]
    Current,
    #[error("a related session holds foreground")]
    RelatedCannotStop,
}

/// Options for one stop request.
pub struct StopRequest {
    /// Bypass the foreground rejection (never the system rejection).
    pub force: bool,
    /// Caller's consent to keep the storage key warm under delayed locking.
    pub allow_delayed_locking: bool,
    pub on_stopped: Option<StopCallback>,
    pub on_key_evicted: Option<KeyEvictedCallback>,
}

impl StopRequest {
    pub fn new() -> Self {
        StopRequest {
            force: false,
            allow_delayed_locking: false,
            on_stopped: None,
            on_key_evicted: None,
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn allow_delayed_locking(mut self) -> Self {
        self.allow_delayed_locking = true;
        self
    }

    pub fn on_stopped(mut self, cb: StopCallback) -> Self {
        self.on_stopped = Some(cb);
        self
    }

    pub fn on_key_evicted(mut self, cb: KeyEvictedCallback) -> Self {
        self.on_key_evicted = Some(cb);
        self
    }
}

impl Default for StopRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Stop a session (and, unless forced, its related profile group).
    /// Returns as soon as the drain is underway; completion arrives through
    /// the request's callbacks.
    pub fn stop(&self, id: SessionId, request: StopRequest) -> Result<(), StopError> {
        let StopRequest {
            force,
            allow_delayed_locking,
            on_stopped,
            on_key_evicted,
        } = request;
        let plan = self
            .inner
            .registry
            .begin_stop(id, force, on_stopped, on_key_evicted)?;
        match plan {
            StopPlan::NotStarted {
                stop_callback,
                key_evicted_callback,
            } => {
                self.settle_unstarted_stop(
                    id,
                    allow_delayed_locking,
                    stop_callback,
                    key_evicted_callback,
                );
                Ok(())
            }
            StopPlan::Proceed(tickets) => {
                for ticket in tickets {
                    if ticket.newly_stopping {
                        let this = self.clone();
                        let StopTicket { id, token, .. } = ticket;
                        tokio::spawn(async move {
                            this.drive_stop(id, token, allow_delayed_locking).await;
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Stop of a session with no registry entry: complete immediately, but
    /// the eviction policy still settles (the id may have been warm).
    fn settle_unstarted_stop(
        &self,
        id: SessionId,
        allow_delayed_locking: bool,
        stop_callback: Option<StopCallback>,
        key_evicted_callback: Option<KeyEvictedCallback>,
    ) {
        let keep_warm = self
            .inner
            .accounts
            .info(id)
            .map(|info| self.keep_warm(&info, allow_delayed_locking))
            .unwrap_or(false);
        let (evict, pending) = self.inner.registry.settle_unstarted_stop(
            id,
            keep_warm,
            self.inner.config.max_unlocked,
            key_evicted_callback,
        );
        if let Some(cb) = stop_callback {
            cb(id, StopOutcome::AlreadyStopped);
        }
        self.apply_eviction(evict);
        self.replay_pending_starts(pending);
    }

    /// Drain continuation for one session. Each guarded step aborts the
    /// remainder when the session was resurrected by a replayed start.
    pub(crate) async fn drive_stop(
        &self,
        id: SessionId,
        token: SessionToken,
        allow_delayed_locking: bool,
    ) {
        use crate::state::SessionState::{Shutdown, Stopping};

        tracing::info!(session = %id, "stopping session");
        if let Err(err) = self
            .inner
            .broadcasts
            .send_ordered(LifecycleEvent::Stopping(id))
            .await
        {
            tracing::warn!(session = %id, %err, "stopping broadcast failed");
        }
        if !self.inner.registry.transition(id, &token, Stopping, Shutdown) {
            tracing::debug!(session = %id, "stop aborted after stopping phase");
            return;
        }
        if let Err(err) = self
            .inner
            .broadcasts
            .send_ordered(LifecycleEvent::Shutdown(id))
            .await
        {
            tracing::warn!(session = %id, %err, "shutdown broadcast failed");
        }

        let keep_warm = self
            .inner
            .registry
            .info_of(id)
            .map(|info| self.keep_warm(&info, allow_delayed_locking))
            .unwrap_or(false);
        let Some(removed) = self.inner.registry.remove_if_shutdown(
            id,
            &token,
            keep_warm,
            self.inner.config.max_unlocked,
        ) else {
            tracing::debug!(session = %id, "stop aborted before removal");
            return;
        };
        tracing::info!(session = %id, "session stopped");

        for cb in removed.stop_callbacks {
            cb(id, StopOutcome::Stopped);
        }
        if removed.info.ephemeral {
            self.inner.accounts.remove_account(id);
        }
        self.apply_eviction(removed.evict);
        self.replay_pending_starts(removed.pending_starts);
    }

    fn apply_eviction(&self, evict: Option<(SessionId, Vec<KeyEvictedCallback>)>) {
        if let Some((victim, callbacks)) = evict {
            tracing::info!(session = %victim, "locking storage key");
            self.inner.storage.lock(victim);
            for cb in callbacks {
                cb(victim);
            }
        }
    }

    /// Whether a just-stopped session's storage key may stay warm.
    fn keep_warm(&self, info: &AccountInfo, allow_delayed_locking: bool) -> bool {
        allow_delayed_locking
            && info
                .allow_delayed_locking
                .unwrap_or(self.inner.config.delayed_locking)
            && !info.ephemeral
            && !info.background_restricted
    }
}
