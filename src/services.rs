//! Narrow interfaces to the external collaborators of the orchestration
//! core, plus in-process default implementations.
//!
//! The core only ever sees these traits; constructor injection (one trait
//! per collaborator category) replaces any swappable-injector machinery.
//! None of these methods may be called while the registry mutex is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::journey::{JourneyKind, JourneyPhase};
use crate::state::SessionId;

/// Snapshot of an account as seen by the orchestrator.
///
/// Captured once when a session is created and stored on the session
/// record, so related-session and eviction decisions never have to call
/// back into the account store under the registry mutex.
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    /// Parent session of a profile; `None` for a full session.
    pub parent: Option<SessionId>,
    /// Ephemeral accounts are deleted from the store after their session
    /// stops, and never keep their storage warm.
    pub ephemeral: bool,
    /// Whether this account may hold foreground focus. Profiles cannot.
    pub full: bool,
    /// Restricted from running in the background; stopped when focus moves
    /// away, and never kept warm.
    pub background_restricted: bool,
    /// Per-account override of the global delayed-locking flag.
    pub allow_delayed_locking: Option<bool>,
    /// Platform build fingerprint recorded at the account's last boot.
    pub last_fingerprint: Option<String>,
}

impl AccountInfo {
    /// A plain foreground-eligible account.
    pub fn full_session() -> Self {
        AccountInfo {
            full: true,
            ..Default::default()
        }
    }

    /// A profile attached to `parent`.
    pub fn profile_of(parent: SessionId) -> Self {
        AccountInfo {
            parent: Some(parent),
            ..Default::default()
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn background_restricted(mut self) -> Self {
        self.background_restricted = true;
        self
    }
}

/// The on-disk user-account store.
pub trait AccountStore: Send + Sync {
    fn info(&self, id: SessionId) -> Option<AccountInfo>;

    /// Permanently delete an ephemeral account after its session stops.
    fn remove_account(&self, id: SessionId);

    /// Persist the platform fingerprint after a completed pre-boot
    /// broadcast sequence.
    fn set_last_fingerprint(&self, id: SessionId, fingerprint: &str);
}

/// Lifecycle notifications delivered to applications by the (external)
/// broadcast mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started(SessionId),
    Stopping(SessionId),
    Shutdown(SessionId),
    Unlocking(SessionId),
    Unlocked(SessionId),
    /// A profile finished unlocking; additionally addressed to its parent.
    ProfileUnlocked { profile: SessionId, parent: SessionId },
    /// One-shot sequence run before first boot on a new platform build.
    PreBoot(SessionId),
    SwitchComplete { from: SessionId, to: SessionId },
}

#[derive(Debug, thiserror::Error)]
#[error("broadcast delivery failed: {0}")]
pub struct BroadcastError(pub String);

/// Notification dispatch.
#[async_trait]
pub trait Broadcasts: Send + Sync {
    /// Ordered delivery: resolves only once every recipient has observed
    /// the event. The stop workflow gates its next step on this.
    async fn send_ordered(&self, event: LifecycleEvent) -> Result<(), BroadcastError>;

    /// Fire-and-forget delivery.
    fn send(&self, event: LifecycleEvent);
}

#[derive(Debug, thiserror::Error)]
#[error("storage unlock failed for session {0}")]
pub struct StorageError(pub SessionId);

/// Per-session encrypted storage.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn is_unlocked(&self, id: SessionId) -> bool;

    /// Unlock the session's storage key. May fail; failure means the
    /// session simply stays locked.
    async fn unlock(&self, id: SessionId) -> Result<(), StorageError>;

    /// Evict (lock) the session's storage key.
    fn lock(&self, id: SessionId);
}

/// Display / session-visual service: screen freeze during switches,
/// keyguard confirmation.
#[async_trait]
pub trait DisplayService: Send + Sync {
    fn freeze(&self);
    fn unfreeze(&self);
    fn set_current(&self, id: SessionId);

    /// Resolves once the keyguard reports shown. The caller bounds the
    /// wait; the return value reports confirmation.
    async fn show_keyguard(&self) -> bool;

    /// Resolves once the keyguard reports dismissed.
    async fn dismiss_keyguard(&self) -> bool;
}

/// Observability sink for journey begin/end records.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, kind: JourneyKind, phase: JourneyPhase, id: SessionId);
}

// ---- In-process defaults -------------------------------------------------
//
// Used by the daemon binary when no real collaborators are wired in, and by
// tests as recordable doubles.

/// Account store backed by a hash map.
#[derive(Default)]
pub struct StaticAccounts {
    accounts: Mutex<HashMap<SessionId, AccountInfo>>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SessionId, info: AccountInfo) {
        self.accounts.lock().insert(id, info);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.accounts.lock().contains_key(&id)
    }
}

impl AccountStore for StaticAccounts {
    fn info(&self, id: SessionId) -> Option<AccountInfo> {
        self.accounts.lock().get(&id).cloned()
    }

    fn remove_account(&self, id: SessionId) {
        if self.accounts.lock().remove(&id).is_some() {
            tracing::info!(session = %id, "removed ephemeral account");
        }
    }

    fn set_last_fingerprint(&self, id: SessionId, fingerprint: &str) {
        if let Some(info) = self.accounts.lock().get_mut(&id) {
            info.last_fingerprint = Some(fingerprint.to_string());
        }
    }
}

/// Storage service that tracks unlocked keys in memory.
///
/// `fail_unlock_for` marks sessions whose unlock should fail, for
/// exercising the stay-locked path.
#[derive(Default)]
pub struct InMemoryStorage {
    unlocked: Mutex<HashSet<SessionId>>,
    failing: Mutex<HashSet<SessionId>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_unlock_for(&self, id: SessionId) {
        self.failing.lock().insert(id);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Ids whose storage is currently unlocked.
    pub fn unlocked_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.unlocked.lock().iter().copied().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl StorageService for InMemoryStorage {
    fn is_unlocked(&self, id: SessionId) -> bool {
        self.unlocked.lock().contains(&id)
    }

    async fn unlock(&self, id: SessionId) -> Result<(), StorageError> {
        if self.failing.lock().contains(&id) {
            return Err(StorageError(id));
        }
        self.unlocked.lock().insert(id);
        Ok(())
    }

    fn lock(&self, id: SessionId) {
        self.unlocked.lock().remove(&id);
    }
}

/// Broadcast dispatch that records every event and delivers instantly.
#[derive(Default)]
pub struct RecordingBroadcasts {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingBroadcasts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl Broadcasts for RecordingBroadcasts {
    async fn send_ordered(&self, event: LifecycleEvent) -> Result<(), BroadcastError> {
        tracing::debug!(?event, "ordered broadcast");
        self.events.lock().push(event);
        Ok(())
    }

    fn send(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "broadcast");
        self.events.lock().push(event);
    }
}

/// Display service that acknowledges everything immediately.
#[derive(Default)]
pub struct NullDisplay;

impl NullDisplay {
    pub fn new() -> Self {
        NullDisplay
    }
}

#[async_trait]
impl DisplayService for NullDisplay {
    fn freeze(&self) {}
    fn unfreeze(&self) {}
    fn set_current(&self, _id: SessionId) {}

    async fn show_keyguard(&self) -> bool {
        true
    }

    async fn dismiss_keyguard(&self) -> bool {
        true
    }
}

/// Telemetry sink that forwards journey records to the log.
#[derive(Default)]
pub struct LogTelemetry;

impl LogTelemetry {
    pub fn new() -> Self {
        LogTelemetry
    }
}

impl TelemetrySink for LogTelemetry {
    fn record(&self, kind: JourneyKind, phase: JourneyPhase, id: SessionId) {
        tracing::info!(session = %id, ?kind, ?phase, "journey");
    }
}

/// Bundle of default in-process collaborators, shared-ownership form.
///
/// The daemon binary and most tests construct the orchestrator from one of
/// these; tests keep clones of the Arcs to inspect recorded state.
#[derive(Clone)]
pub struct LocalServices {
    pub accounts: Arc<StaticAccounts>,
    pub storage: Arc<InMemoryStorage>,
    pub broadcasts: Arc<RecordingBroadcasts>,
    pub display: Arc<NullDisplay>,
    pub telemetry: Arc<LogTelemetry>,
}

impl LocalServices {
    pub fn new() -> Self {
        LocalServices {
            accounts: Arc::new(StaticAccounts::new()),
            storage: Arc::new(InMemoryStorage::new()),
            broadcasts: Arc::new(RecordingBroadcasts::new()),
            display: Arc::new(NullDisplay::new()),
            telemetry: Arc::new(LogTelemetry::new()),
        }
    }
}

impl Default for LocalServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_accounts_roundtrip() {
        let accounts = StaticAccounts::new();
        accounts.insert(SessionId(10), AccountInfo::full_session());
        assert!(accounts.contains(SessionId(10)));
        assert!(accounts.info(SessionId(10)).unwrap().full);
        assert!(accounts.info(SessionId(11)).is_none());

        accounts.remove_account(SessionId(10));
        assert!(!accounts.contains(SessionId(10)));
    }

    #[test]
    fn account_info_builders() {
        let info = AccountInfo::profile_of(SessionId(10)).ephemeral();
        assert_eq!(info.parent, Some(SessionId(10)));
        assert!(info.ephemeral);
        assert!(!info.full);

        let info = AccountInfo::full_session().background_restricted();
        assert!(info.full && info.background_restricted);
    }

    #[tokio::test]
    async fn in_memory_storage_unlock_and_lock() {
        let storage = InMemoryStorage::new();
        assert!(!storage.is_unlocked(SessionId(10)));

        storage.unlock(SessionId(10)).await.unwrap();
        assert!(storage.is_unlocked(SessionId(10)));
        assert_eq!(storage.unlocked_ids(), vec![SessionId(10)]);

        storage.lock(SessionId(10));
        assert!(!storage.is_unlocked(SessionId(10)));
    }

    #[tokio::test]
    async fn in_memory_storage_can_fail() {
        let storage = InMemoryStorage::new();
        storage.fail_unlock_for(SessionId(10));
        assert!(storage.unlock(SessionId(10)).await.is_err());
        assert!(!storage.is_unlocked(SessionId(10)));
    }

    #[tokio::test]
    async fn recording_broadcasts_records_in_order() {
        let broadcasts = RecordingBroadcasts::new();
        broadcasts
            .send_ordered(LifecycleEvent::Stopping(SessionId(10)))
            .await
            .unwrap();
        broadcasts.send(LifecycleEvent::Shutdown(SessionId(10)));

        assert_eq!(
            broadcasts.events(),
            vec![
                LifecycleEvent::Stopping(SessionId(10)),
                LifecycleEvent::Shutdown(SessionId(10)),
            ]
        );
        assert_eq!(
            broadcasts.count(|e| matches!(e, LifecycleEvent::Stopping(_))),
            1
        );
    }
}
