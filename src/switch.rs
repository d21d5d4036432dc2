//! Foreground switch workflow: single-flight admission, observer fan-out
//! with a global timer, exactly-once continuation, keyguard handling, and
//! the FIFO resubmission of queued switch requests.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::journey::JourneyKind;
use crate::orchestrator::{Orchestrator, StartMode};
use crate::pending::PendingStart;
use crate::registry::{BeginSwitch, RunningFilter};
use crate::services::LifecycleEvent;
use crate::state::SessionId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("no such session or account: {0}")]
    UnknownSession(SessionId),
    #[error("session {0} cannot hold foreground")]
    NotSwitchEligible(SessionId),
    #[error("a factory reset is in progress")]
    FactoryResetInProgress,
}

/// Acknowledgement handle passed to each switch observer. Dropping it
/// without calling `ack` counts as never responding; the switch proceeds
/// anyway once the global timer fires.
pub struct SwitchAck {
    name: String,
    waiting: Arc<Mutex<HashSet<String>>>,
    notify: Arc<Notify>,
}

impl SwitchAck {
    pub fn ack(self) {
        self.waiting.lock().remove(&self.name);
        self.notify.notify_waiters();
    }
}

/// Observer of foreground switches. `on_switching` runs on the switch task;
/// long work belongs on the observer's own task, acknowledged via the
/// handle when done.
pub trait SwitchObserver: Send + Sync {
    fn on_switching(&self, from: SessionId, to: SessionId, ack: SwitchAck);

    fn on_switch_complete(&self, _to: SessionId) {}
}

impl Orchestrator {
    pub fn register_switch_observer(&self, name: &str, observer: Arc<dyn SwitchObserver>) {
        self.inner
            .observers
            .write()
            .push((name.to_string(), observer));
    }

    pub fn unregister_switch_observer(&self, name: &str) {
        self.inner.observers.write().retain(|(n, _)| n != name);
    }

    /// Move foreground focus to `target`. Returns once the switch is
    /// admitted (dispatched, queued, or a no-op); the switch itself runs
    /// asynchronously.
    pub fn switch_to(&self, target: SessionId) -> Result<(), SwitchError> {
        if !target.is_system() {
            let info = self
                .inner
                .registry
                .info_of(target)
                .or_else(|| self.inner.accounts.info(target))
                .ok_or(SwitchError::UnknownSession(target))?;
            if !info.full {
                return Err(SwitchError::NotSwitchEligible(target));
            }
        }

        match self.inner.registry.begin_switch(target) {
            BeginSwitch::FactoryReset => Err(SwitchError::FactoryResetInProgress),
            BeginSwitch::TargetDraining => {
                // The whole switch waits for the drain; the replayed
                // foreground start re-dispatches it after removal.
                tracing::info!(%target, "switch target is draining; deferred until shutdown completes");
                self.inner.registry.defer_start(PendingStart {
                    id: target,
                    mode: StartMode::Foreground,
                    listener: None,
                });
                Ok(())
            }
            BeginSwitch::AlreadyForeground => {
                tracing::debug!(%target, "switch is a no-op");
                Ok(())
            }
            BeginSwitch::Queued => {
                tracing::info!(%target, "switch queued behind in-flight switch");
                Ok(())
            }
            BeginSwitch::Proceed { from, generation } => {
                tracing::info!(%from, to = %target, "switching foreground session");
                self.inner.journeys.begin(JourneyKind::SwitchForeground, target);

                // Bring the target up if it is not running.
                match self.inner.registry.state_of(target) {
                    None => {
                        self.start(target, StartMode::Background, None);
                    }
                    Some(state) if !state.is_running() => {
                        // A stop raced the admission; the replayed start
                        // will re-acquire foreground.
                        self.inner.registry.defer_start(PendingStart {
                            id: target,
                            mode: StartMode::Foreground,
                            listener: None,
                        });
                    }
                    Some(_) => {
                        self.inner.registry.note_selected(target);
                    }
                }
                self.inner.registry.set_switching(target, true);
                if self.inner.config.switch_ui_enabled {
                    self.inner.display.freeze();
                }

                let this = self.clone();
                tokio::spawn(async move {
                    this.run_switch(from, target, generation).await;
                });
                Ok(())
            }
        }
    }

    /// The switch task: fan out to observers, wait for acknowledgements or
    /// the global timer, then run the continuation and completion stages.
    async fn run_switch(&self, from: SessionId, target: SessionId, generation: u64) {
        let observers: Vec<(String, Arc<dyn SwitchObserver>)> =
            self.inner.observers.read().clone();
        let waiting: Arc<Mutex<HashSet<String>>> =
            Arc::new(Mutex::new(observers.iter().map(|(n, _)| n.clone()).collect()));
        let notify = Arc::new(Notify::new());

        for (name, observer) in &observers {
            observer.on_switching(
                from,
                target,
                SwitchAck {
                    name: name.clone(),
                    waiting: waiting.clone(),
                    notify: notify.clone(),
                },
            );
        }

        let all_acked = async {
            let notified = notify.notified();
            tokio::pin!(notified);
            loop {
                // enable() registers this waiter before the emptiness
                // check, so an ack landing in between is not lost.
                notified.as_mut().enable();
                if waiting.lock().is_empty() {
                    break;
                }
                notified.as_mut().await;
                notified.set(notify.notified());
            }
        };
        if tokio::time::timeout(self.inner.config.switch_timeout(), all_acked)
            .await
            .is_err()
        {
            tracing::warn!(
                to = %target,
                timeout_ms = self.inner.config.switch_timeout_ms,
                "switch proceeding without all observer acknowledgements"
            );
            // Name the stragglers a little later, for the log only.
            let waiting = waiting.clone();
            let lag = self.inner.config.observer_lag_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(lag).await;
                let stragglers: Vec<String> = waiting.lock().iter().cloned().collect();
                if !stragglers.is_empty() {
                    tracing::warn!(?stragglers, to = %target, "observers never acknowledged switch");
                }
            });
        }

        // Exactly-once continuation, guarded by the switch generation.
        let Some(cont) = self.inner.registry.continue_switch(target, generation) else {
            if self.inner.config.switch_ui_enabled {
                self.inner.display.unfreeze();
            }
            return;
        };
        self.inner.display.set_current(target);
        for outgoing in cont.stop_outgoing {
            tracing::info!(session = %outgoing, "stopping outgoing foreground session");
            if let Err(err) = self.stop(outgoing, crate::stop::StopRequest::new().force()) {
                tracing::warn!(session = %outgoing, %err, "could not stop outgoing session");
            }
        }

        self.complete_switch(cont.from, target, generation).await;
    }

    async fn complete_switch(&self, from: SessionId, target: SessionId, generation: u64) {
        if self.inner.config.switch_ui_enabled {
            if self.is_running(target, RunningFilter::UnlockedOrUnlocking)
                || self.inner.storage.is_unlocked(target)
            {
                let wait = self.inner.config.dismiss_keyguard_timeout();
                match tokio::time::timeout(wait, self.inner.display.dismiss_keyguard()).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        tracing::warn!(to = %target, "keyguard dismissal unconfirmed");
                    }
                }
            } else {
                let wait = self.inner.config.show_keyguard_timeout();
                match tokio::time::timeout(wait, self.inner.display.show_keyguard()).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        tracing::warn!(to = %target, "keyguard not confirmed shown");
                    }
                }
            }
            self.inner.display.unfreeze();
        }

        self.inner
            .broadcasts
            .send(LifecycleEvent::SwitchComplete { from, to: target });
        let observers: Vec<(String, Arc<dyn SwitchObserver>)> =
            self.inner.observers.read().clone();
        for (_, observer) in &observers {
            observer.on_switch_complete(target);
        }
        self.inner.journeys.end(JourneyKind::SwitchForeground, target);
        tracing::info!(to = %target, "switch complete");

        if let Some(done) = self.inner.registry.complete_switch(target, generation) {
            // A rejected resubmission must not strand the rest of the
            // FIFO queue behind it.
            let mut next = done.next;
            while let Some(queued) = next {
                tracing::info!(%queued, "resubmitting queued switch");
                match self.switch_to(queued) {
                    Ok(()) => break,
                    Err(err) => {
                        tracing::warn!(%queued, %err, "queued switch could not be resubmitted");
                        next = self.inner.registry.pop_queued_switch();
                    }
                }
            }
        }
    }
}
