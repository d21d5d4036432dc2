//! Lifecycle orchestrator: the public facade over the registry and the
//! start / unlock / stop / switch workflows.
//!
//! `Orchestrator` is a cheap clone handle; every spawned workflow task
//! carries its own clone. Construction requires a tokio runtime because the
//! primordial system session boots on a spawned task.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SessiondConfig;
use crate::journey::{JourneyKind, JourneyRecorder};
use crate::registry::{Registry, RegistryEvent, RunningFilter};
use crate::services::{
    AccountInfo, AccountStore, Broadcasts, DisplayService, LifecycleEvent, LocalServices,
    StorageService,
};
use crate::state::{SessionId, SessionState, SessionToken};
use crate::switch::SwitchObserver;
use crate::unlock::UnlockListener;

/// How a start request wants the session to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Boot in the background; foreground focus does not move.
    Background,
    /// Boot and take foreground focus (a switch).
    Foreground,
}

pub(crate) struct OrchestratorInner {
    pub(crate) config: SessiondConfig,
    pub(crate) registry: Registry,
    pub(crate) accounts: Arc<dyn AccountStore>,
    pub(crate) storage: Arc<dyn StorageService>,
    pub(crate) broadcasts: Arc<dyn Broadcasts>,
    pub(crate) display: Arc<dyn DisplayService>,
    pub(crate) journeys: JourneyRecorder,
    pub(crate) observers: RwLock<Vec<(String, Arc<dyn SwitchObserver>)>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Build the orchestrator and boot the system session. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: SessiondConfig,
        accounts: Arc<dyn AccountStore>,
        storage: Arc<dyn StorageService>,
        broadcasts: Arc<dyn Broadcasts>,
        display: Arc<dyn DisplayService>,
        journeys: JourneyRecorder,
    ) -> Self {
        let system_info = accounts
            .info(SessionId::SYSTEM)
            .unwrap_or_else(AccountInfo::full_session);
        let registry = Registry::new(system_info);
        let orchestrator = Orchestrator {
            inner: Arc::new(OrchestratorInner {
                config,
                registry,
                accounts,
                storage,
                broadcasts,
                display,
                journeys,
                observers: RwLock::new(Vec::new()),
            }),
        };
        if let Some(token) = orchestrator.inner.registry.token_of(SessionId::SYSTEM) {
            orchestrator
                .inner
                .journeys
                .begin(JourneyKind::SessionStart, SessionId::SYSTEM);
            let this = orchestrator.clone();
            tokio::spawn(async move {
                this.drive_boot(SessionId::SYSTEM, token, None).await;
            });
        }
        orchestrator
    }

    /// Convenience constructor over the in-process default collaborators.
    pub fn with_local_services(config: SessiondConfig, services: &LocalServices) -> Self {
        Orchestrator::new(
            config,
            services.accounts.clone(),
            services.storage.clone(),
            services.broadcasts.clone(),
            services.display.clone(),
            JourneyRecorder::new(services.telemetry.clone()),
        )
    }

    // ---- Queries ---------------------------------------------------------

    /// The effective foreground session: the in-flight switch target if a
    /// switch is underway, else the settled current session.
    pub fn current_session_id(&self) -> SessionId {
        self.inner.registry.current_id()
    }

    /// All started sessions, least-recently selected first.
    pub fn started_session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.started_ids()
    }

    /// The effective current session and its running profile group.
    pub fn current_profile_ids(&self) -> Vec<SessionId> {
        self.inner.registry.current_profile_ids()
    }

    pub fn is_running(&self, id: SessionId, filter: RunningFilter) -> bool {
        self.inner.registry.is_running(id, filter)
    }

    pub fn is_switching(&self, id: SessionId) -> bool {
        self.inner.registry.is_switching(id)
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.inner.registry.state_of(id)
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.inner.registry.subscribe_events()
    }

    /// While set, all switch requests are rejected.
    pub fn set_factory_reset_in_progress(&self, value: bool) {
        tracing::info!(value, "factory reset in progress flag");
        self.inner.registry.set_factory_reset_in_progress(value);
    }

    // ---- Start workflow --------------------------------------------------

    /// Start a session. Returns true when the session is started, already
    /// running, or queued to start once an in-flight stop completes.
    pub fn start(
        &self,
        id: SessionId,
        mode: StartMode,
        listener: Option<Arc<dyn UnlockListener>>,
    ) -> bool {
        match mode {
            StartMode::Background => self.start_background(id, listener),
            StartMode::Foreground => {
                if !self.start_background(id, listener) {
                    return false;
                }
                match self.switch_to(id) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(session = %id, %err, "foreground start could not switch");
                        false
                    }
                }
            }
        }
    }

    fn start_background(&self, id: SessionId, listener: Option<Arc<dyn UnlockListener>>) -> bool {
        match self.inner.registry.state_of(id) {
            Some(state) if state.is_running() => {
                // Already started: refresh recency and let any listener
                // ride the unlock machinery.
                self.inner.registry.note_selected(id);
                if listener.is_some() {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.unlock(id, listener).await;
                    });
                }
                true
            }
            Some(_) => {
                // Draining: queue the request for replay after removal.
                self.inner.registry.defer_start(crate::pending::PendingStart {
                    id,
                    mode: StartMode::Background,
                    listener,
                });
                true
            }
            None => {
                let Some(info) = self.inner.accounts.info(id) else {
                    tracing::warn!(session = %id, "start refused: no such account");
                    if let Some(l) = listener {
                        l.on_finished(id, false);
                    }
                    return false;
                };
                let Some(token) = self.inner.registry.create(id, info) else {
                    // Lost a creation race; the winner's boot task covers us.
                    return true;
                };
                tracing::info!(session = %id, "starting session");
                self.inner.journeys.begin(JourneyKind::SessionStart, id);
                let this = self.clone();
                tokio::spawn(async move {
                    this.drive_boot(id, token, listener).await;
                });
                true
            }
        }
    }

    /// Boot continuation: runs on its own task, never under the registry
    /// mutex. Aborts silently whenever a guarded transition refuses.
    pub(crate) async fn drive_boot(
        &self,
        id: SessionId,
        token: SessionToken,
        listener: Option<Arc<dyn UnlockListener>>,
    ) {
        if let Err(err) = self
            .inner
            .broadcasts
            .send_ordered(LifecycleEvent::Started(id))
            .await
        {
            tracing::warn!(session = %id, %err, "started broadcast failed");
        }
        if !self.inner.registry.transition(
            id,
            &token,
            SessionState::Booting,
            SessionState::RunningLocked,
        ) {
            // A stop preempted the boot; the start journey ends here.
            self.inner.journeys.end(JourneyKind::SessionStart, id);
            if let Some(l) = listener {
                l.on_finished(id, false);
            }
            return;
        }
        self.inner.journeys.end(JourneyKind::SessionStart, id);
        // Every started session gets an unlock attempt; a locked parent
        // just means the attempt bails and the cascade retries later.
        self.unlock(id, listener).await;
    }

    /// Replay queued starts after a stop finished removing their session.
    pub(crate) fn replay_pending_starts(&self, entries: Vec<crate::pending::PendingStart>) {
        for entry in entries {
            tracing::info!(session = %entry.id, "replaying deferred start");
            self.start(entry.id, entry.mode, entry.listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{LocalServices, StorageService};
    use tokio::time::{sleep, Duration};

    async fn settle() {
        // Workflow tasks run on the same single-threaded test runtime;
        // yielding a few times lets the spawned chains finish.
        for _ in 0..20 {
            sleep(Duration::from_millis(1)).await;
        }
    }

    fn orchestrator() -> (Orchestrator, LocalServices) {
        let services = LocalServices::new();
        services
            .accounts
            .insert(SessionId::SYSTEM, AccountInfo::full_session());
        services
            .accounts
            .insert(SessionId(10), AccountInfo::full_session());
        let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);
        (orch, services)
    }

    #[tokio::test]
    async fn system_session_boots_to_unlocked() {
        let (orch, services) = orchestrator();
        settle().await;
        assert_eq!(
            orch.session_state(SessionId::SYSTEM),
            Some(SessionState::Unlocked)
        );
        assert!(services.storage.is_unlocked(SessionId::SYSTEM));
        assert_eq!(orch.current_session_id(), SessionId::SYSTEM);
    }

    #[tokio::test]
    async fn background_start_runs_and_unlocks() {
        let (orch, services) = orchestrator();
        assert!(orch.start(SessionId(10), StartMode::Background, None));
        settle().await;

        assert_eq!(orch.session_state(SessionId(10)), Some(SessionState::Unlocked));
        assert!(orch.is_running(SessionId(10), RunningFilter::Unlocked));
        // Background start never moves foreground.
        assert_eq!(orch.current_session_id(), SessionId::SYSTEM);
        assert!(services
            .broadcasts
            .events()
            .contains(&LifecycleEvent::Started(SessionId(10))));
    }

    #[tokio::test]
    async fn start_unknown_account_fails() {
        let (orch, _services) = orchestrator();
        assert!(!orch.start(SessionId(99), StartMode::Background, None));
        assert!(orch.session_state(SessionId(99)).is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent_for_running_session() {
        let (orch, services) = orchestrator();
        assert!(orch.start(SessionId(10), StartMode::Background, None));
        settle().await;
        assert!(orch.start(SessionId(10), StartMode::Background, None));
        settle().await;
        assert_eq!(
            services
                .broadcasts
                .count(|e| matches!(e, LifecycleEvent::Started(id) if *id == SessionId(10))),
            1
        );
    }

    #[tokio::test]
    async fn foreground_start_switches() {
        let (orch, _services) = orchestrator();
        assert!(orch.start(SessionId(10), StartMode::Foreground, None));
        settle().await;
        assert_eq!(orch.current_session_id(), SessionId(10));
    }

    #[tokio::test]
    async fn locked_profile_waits_for_parent() {
        let services = LocalServices::new();
        services
            .accounts
            .insert(SessionId::SYSTEM, AccountInfo::full_session());
        services
            .accounts
            .insert(SessionId(10), AccountInfo::full_session());
        services
            .accounts
            .insert(SessionId(11), AccountInfo::profile_of(SessionId(10)));
        // Parent storage unlock fails, so the parent stays RunningLocked.
        services.storage.fail_unlock_for(SessionId(10));
        let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

        orch.start(SessionId(10), StartMode::Background, None);
        orch.start(SessionId(11), StartMode::Background, None);
        settle().await;

        assert_eq!(
            orch.session_state(SessionId(10)),
            Some(SessionState::RunningLocked)
        );
        // Profile cannot pass its parent.
        assert_eq!(
            orch.session_state(SessionId(11)),
            Some(SessionState::RunningLocked)
        );
    }
}
