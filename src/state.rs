use std::fmt;
use std::sync::Arc;

use crate::services::AccountInfo;
use crate::stop::{KeyEvictedCallback, StopCallback};
use crate::unlock::UnlockListener;

/// Stable identifier for a session. `SessionId::SYSTEM` (id 0) denotes the
/// primordial system session, which is always present and never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    pub const SYSTEM: SessionId = SessionId(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a single session.
///
/// `Shutdown` is a terminal transient: the session is removed from the
/// registry as soon as the stop workflow observes it together with the
/// stopped confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Booting,
    RunningLocked,
    Unlocking,
    Unlocked,
    Stopping,
    Shutdown,
}

impl SessionState {
    /// True for every state that counts as "running" (not draining).
    pub fn is_running(self) -> bool {
        !matches!(self, SessionState::Stopping | SessionState::Shutdown)
    }

    /// Whether `from -> to` is an edge the state machine permits.
    ///
    /// The `Stopping -> running` and `Shutdown -> Booting` edges exist for
    /// the replay of a start request that raced a stop; they are only taken
    /// by the pending-start queue, never by a concurrent flip.
    pub fn is_valid_edge(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (Booting, RunningLocked) => true,
            (RunningLocked, Unlocking) => true,
            (Unlocking, Unlocked) => true,
            (f, Stopping) if f.is_running() => true,
            (Stopping, Shutdown) => true,
            // Resurrection edges.
            (Stopping, t) if t.is_running() => true,
            (Shutdown, Booting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Booting => "booting",
            SessionState::RunningLocked => "running-locked",
            SessionState::Unlocking => "unlocking",
            SessionState::Unlocked => "unlocked",
            SessionState::Stopping => "stopping",
            SessionState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Identity marker for a `Session` record.
///
/// A workflow captures the token when it looks a session up and passes it
/// back with every guarded mutation. The registry applies the mutation only
/// if the token still matches the live record, so an operation holding a
/// reference across a stop-then-restart cycle can never mutate the
/// replacement session.
#[derive(Clone)]
pub struct SessionToken(Arc<()>);

impl SessionToken {
    pub fn new() -> Self {
        SessionToken(Arc::new(()))
    }

    pub fn same(&self, other: &SessionToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({:p})", Arc::as_ptr(&self.0))
    }
}

/// One session's record inside the registry.
///
/// Mutated exclusively under the registry mutex. After removal the record
/// stays valid for callbacks already holding pieces of it, but lookups by id
/// find either nothing or a fresh record with a different token.
pub struct Session {
    pub id: SessionId,
    /// Account snapshot taken at creation. Profile parentage, ephemerality,
    /// and restrictions are read from here so the stop/unlock paths never
    /// call the account store under the mutex.
    pub info: AccountInfo,
    pub state: SessionState,
    /// State preempted by a stop request; the replayed start resumes here
    /// when the stop is aborted.
    pub last_state: SessionState,
    /// True while this session is the target of an in-flight switch fan-out.
    pub switching: bool,
    /// Set when an unlock workflow has begun for the current incarnation.
    pub unlock_started: bool,
    /// Listeners to notify of unlock progress and completion. Each receives
    /// exactly one terminal notification, even on early bail-out.
    pub unlock_waiters: Vec<Arc<dyn UnlockListener>>,
    /// Completion callbacks accumulated across repeated stop requests.
    pub stop_callbacks: Vec<StopCallback>,
    /// Callbacks to fire when this session's storage key is finally evicted.
    pub key_evicted_callbacks: Vec<KeyEvictedCallback>,
    pub token: SessionToken,
}

impl Session {
    pub fn new(id: SessionId, info: AccountInfo) -> Self {
        Session {
            id,
            info,
            state: SessionState::Booting,
            last_state: SessionState::Booting,
            switching: false,
            unlock_started: false,
            unlock_waiters: Vec::new(),
            stop_callbacks: Vec::new(),
            key_evicted_callbacks: Vec::new(),
            token: SessionToken::new(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_state", &self.last_state)
            .field("switching", &self.switching)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn forward_edges_are_valid() {
        assert!(SessionState::is_valid_edge(Booting, RunningLocked));
        assert!(SessionState::is_valid_edge(RunningLocked, Unlocking));
        assert!(SessionState::is_valid_edge(Unlocking, Unlocked));
        assert!(SessionState::is_valid_edge(Stopping, Shutdown));
    }

    #[test]
    fn any_running_state_can_stop() {
        assert!(SessionState::is_valid_edge(Booting, Stopping));
        assert!(SessionState::is_valid_edge(RunningLocked, Stopping));
        assert!(SessionState::is_valid_edge(Unlocking, Stopping));
        assert!(SessionState::is_valid_edge(Unlocked, Stopping));
    }

    #[test]
    fn resurrection_edges_are_valid() {
        assert!(SessionState::is_valid_edge(Stopping, Unlocked));
        assert!(SessionState::is_valid_edge(Stopping, RunningLocked));
        assert!(SessionState::is_valid_edge(Shutdown, Booting));
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(!SessionState::is_valid_edge(Booting, Unlocking));
        assert!(!SessionState::is_valid_edge(Booting, Unlocked));
        assert!(!SessionState::is_valid_edge(RunningLocked, Unlocked));
        assert!(!SessionState::is_valid_edge(Unlocked, RunningLocked));
        assert!(!SessionState::is_valid_edge(Shutdown, Stopping));
        assert!(!SessionState::is_valid_edge(Shutdown, Unlocked));
    }

    #[test]
    fn stopping_states_are_not_running() {
        assert!(!Stopping.is_running());
        assert!(!Shutdown.is_running());
        assert!(Booting.is_running());
        assert!(Unlocked.is_running());
    }

    #[test]
    fn token_identity() {
        let a = SessionToken::new();
        let b = SessionToken::new();
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn system_id() {
        assert!(SessionId(0).is_system());
        assert!(!SessionId(10).is_system());
        assert_eq!(SessionId::SYSTEM, SessionId(0));
    }
}
