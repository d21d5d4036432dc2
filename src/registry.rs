//! Session registry: authoritative map of session id to session state plus
//! the auxiliary indices (LRU order, pending switch FIFO, pending-start
//! queue, delayed-locking warm list) and the foreground bookkeeping
//! (`current_id` / `target_id`).
//!
//! All mutable state lives behind one `parking_lot::Mutex`. This module is
//! data consistency only: nothing here calls an external collaborator, so
//! no code path can hold the mutex across a collaborator call. Workflows
//! take a `SessionToken` at lookup time and pass it back with every guarded
//! mutation; a stale token means the registry has since replaced or removed
//! the session and the mutation is refused.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::eviction::DelayedLockingPolicy;
use crate::pending::{PendingStart, PendingStartQueue};
use crate::services::AccountInfo;
use crate::state::{Session, SessionId, SessionState, SessionToken};
use crate::stop::{KeyEvictedCallback, StopCallback, StopError};
use crate::unlock::UnlockListener;

/// Registry-level lifecycle events, for observability and tests.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Created(SessionId),
    StateChanged {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
    Removed(SessionId),
}

/// Filter for `is_running` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningFilter {
    /// Any non-draining state.
    Any,
    /// Running but storage still locked (booting counts as locked).
    Locked,
    /// Fully unlocked only.
    Unlocked,
    /// Unlocking or unlocked.
    UnlockedOrUnlocking,
}

/// Outcome of registering a listener and asking to begin an unlock.
pub enum BeginUnlock {
    NotFound,
    /// Session is already unlocked; the caller's listener (if any) gets an
    /// immediate terminal notification.
    AlreadyUnlocked,
    /// An unlock is already in flight; the listener rides along.
    InFlight,
    /// The session cannot unlock right now (not `RunningLocked`, or its
    /// parent is not unlocked). The listener gets a terminal notification.
    NotUnlockable,
    /// The caller drives the workflow.
    Ready {
        token: SessionToken,
        info: AccountInfo,
    },
}

/// Per-session outcome of a stop request.
pub struct StopTicket {
    pub id: SessionId,
    pub token: SessionToken,
    /// True when this request transitioned the session to `Stopping`; false
    /// when it only appended callbacks to a stop already in flight.
    pub newly_stopping: bool,
}

/// What a stop request should do next.
pub enum StopPlan {
    /// The requested id has no registry entry: the caller synthesizes the
    /// completion and applies the eviction policy immediately. The
    /// callbacks come back untouched.
    NotStarted {
        stop_callback: Option<StopCallback>,
        key_evicted_callback: Option<KeyEvictedCallback>,
    },
    Proceed(Vec<StopTicket>),
}

/// Everything a completed stop removal yields, collected under one lock.
pub struct RemovedSession {
    pub info: AccountInfo,
    pub stop_callbacks: Vec<StopCallback>,
    /// Storage key to lock now, with the callbacks owed for it. The id is
    /// not necessarily the removed session (the policy may evict a colder
    /// warm entry instead).
    pub evict: Option<(SessionId, Vec<KeyEvictedCallback>)>,
    pub pending_starts: Vec<PendingStart>,
}

/// Outcome of asking to begin a switch.
pub enum BeginSwitch {
    FactoryReset,
    /// Target is mid-drain (`Stopping`/`Shutdown`): the switch must not
    /// dispatch; the caller queues it for replay after removal.
    TargetDraining,
    /// Target already holds (effective) foreground and nothing is in
    /// flight, or it is the in-flight target already.
    AlreadyForeground,
    /// A switch is in flight; the target was queued FIFO.
    Queued,
    Proceed {
        from: SessionId,
        generation: u64,
    },
}

pub struct ContinueSwitch {
    pub from: SessionId,
    /// Outgoing sessions to stop in the background (ephemeral or
    /// background-restricted).
    pub stop_outgoing: Vec<SessionId>,
}

pub struct CompleteSwitch {
    pub from: SessionId,
    /// Next queued switch target, if any.
    pub next: Option<SessionId>,
}

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    /// Started session ids, least-recently selected first.
    lru: Vec<SessionId>,
    current_id: SessionId,
    target_id: Option<SessionId>,
    /// Bumped at every switch dispatch; continuations must present the
    /// matching generation, which makes the fan-in exactly-once.
    switch_generation: u64,
    switch_continued: bool,
    switch_queue: VecDeque<SessionId>,
    pending_starts: PendingStartQueue,
    policy: DelayedLockingPolicy,
    /// Key-evicted callbacks owed for sessions kept warm, fired when the
    /// policy finally selects them.
    warm_key_callbacks: HashMap<SessionId, Vec<KeyEvictedCallback>>,
    factory_reset_in_progress: bool,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    events_tx: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Create the registry with the primordial system session already
    /// present (state `Booting`, holding foreground).
    pub fn new(system_info: AccountInfo) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let mut sessions = HashMap::new();
        sessions.insert(SessionId::SYSTEM, Session::new(SessionId::SYSTEM, system_info));
        Registry {
            inner: Mutex::new(RegistryInner {
                sessions,
                lru: vec![SessionId::SYSTEM],
                current_id: SessionId::SYSTEM,
                target_id: None,
                switch_generation: 0,
                switch_continued: false,
                switch_queue: VecDeque::new(),
                pending_starts: PendingStartQueue::new(),
                policy: DelayedLockingPolicy::new(),
                warm_key_callbacks: HashMap::new(),
                factory_reset_in_progress: false,
            }),
            events_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    // ---- Lookups ---------------------------------------------------------

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().sessions.contains_key(&id)
    }

    pub fn token_of(&self, id: SessionId) -> Option<SessionToken> {
        self.inner.lock().sessions.get(&id).map(|s| s.token.clone())
    }

    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.inner.lock().sessions.get(&id).map(|s| s.state)
    }

    pub fn info_of(&self, id: SessionId) -> Option<AccountInfo> {
        self.inner.lock().sessions.get(&id).map(|s| s.info.clone())
    }

    /// Effective foreground id: the in-flight switch target when one
    /// exists, else the settled current id.
    pub fn current_id(&self) -> SessionId {
        let inner = self.inner.lock();
        inner.target_id.unwrap_or(inner.current_id)
    }

    pub fn target_id(&self) -> Option<SessionId> {
        self.inner.lock().target_id
    }

    /// Started session ids, least-recently selected first.
    pub fn started_ids(&self) -> Vec<SessionId> {
        self.inner.lock().lru.clone()
    }

    pub fn is_running(&self, id: SessionId, filter: RunningFilter) -> bool {
        let inner = self.inner.lock();
        let Some(session) = inner.sessions.get(&id) else {
            return false;
        };
        use SessionState::*;
        match filter {
            RunningFilter::Any => session.state.is_running(),
            RunningFilter::Locked => matches!(session.state, Booting | RunningLocked),
            RunningFilter::Unlocked => session.state == Unlocked,
            RunningFilter::UnlockedOrUnlocking => matches!(session.state, Unlocking | Unlocked),
        }
    }

    /// Started sessions in the effective current session's profile group,
    /// the effective current first.
    pub fn current_profile_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock();
        let current = inner.target_id.unwrap_or(inner.current_id);
        let root = Self::group_root(&inner, current);
        let mut ids = vec![current];
        for (id, session) in &inner.sessions {
            if *id != current && session.state.is_running() && Self::group_root(&inner, *id) == root
            {
                ids.push(*id);
            }
        }
        ids
    }

    pub fn warm_ids(&self) -> Vec<SessionId> {
        self.inner.lock().policy.warm_ids()
    }

    fn group_root(inner: &RegistryInner, id: SessionId) -> SessionId {
        inner
            .sessions
            .get(&id)
            .and_then(|s| s.info.parent)
            .unwrap_or(id)
    }

    fn is_current_or_target(inner: &RegistryInner, id: SessionId) -> bool {
        id == inner.current_id || inner.target_id == Some(id)
    }

    // ---- Session creation ------------------------------------------------

    /// Insert a fresh `Booting` session. Returns its token, or `None` if
    /// the id is already present.
    pub fn create(&self, id: SessionId, info: AccountInfo) -> Option<SessionToken> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&id) {
            return None;
        }
        let session = Session::new(id, info);
        let token = session.token.clone();
        inner.sessions.insert(id, session);
        inner.lru.push(id);
        inner.policy.note_started(id);
        drop(inner);
        let _ = self.events_tx.send(RegistryEvent::Created(id));
        Some(token)
    }

    /// Move `id` to the most-recently-selected end of the LRU order.
    pub fn note_selected(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.lru.iter().position(|&s| s == id) {
            inner.lru.remove(pos);
            inner.lru.push(id);
        }
    }

    /// Queue a start request for a session that is mid-shutdown.
    pub fn defer_start(&self, entry: PendingStart) {
        self.inner.lock().pending_starts.push(entry);
    }

    // ---- Guarded state machine -------------------------------------------

    /// Apply `from -> to` only if the token is current, the session is in
    /// `from`, and the edge is valid. Returns false otherwise, leaving the
    /// state untouched; callers must abort their remaining steps on false.
    pub fn transition(
        &self,
        id: SessionId,
        token: &SessionToken,
        from: SessionState,
        to: SessionState,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(&id) else {
            tracing::debug!(session = %id, "transition refused: no such session");
            return false;
        };
        if !session.token.same(token) {
            tracing::debug!(session = %id, "transition refused: stale session reference");
            return false;
        }
        if session.state != from || !SessionState::is_valid_edge(from, to) {
            tracing::debug!(
                session = %id,
                actual = %session.state,
                expected = %from,
                to = %to,
                "transition refused"
            );
            return false;
        }
        session.state = to;
        drop(inner);
        let _ = self.events_tx.send(RegistryEvent::StateChanged { id, from, to });
        true
    }

    // ---- Unlock workflow support -----------------------------------------

    /// Register `listener` (if any) and decide how the unlock of `id`
    /// should proceed, atomically.
    pub fn begin_unlock(
        &self,
        id: SessionId,
        listener: Option<Arc<dyn UnlockListener>>,
    ) -> BeginUnlock {
        let mut inner = self.inner.lock();
        let (state, parent, unlock_started) = match inner.sessions.get(&id) {
            Some(s) => (s.state, s.info.parent, s.unlock_started),
            None => return BeginUnlock::NotFound,
        };
        if state == SessionState::Unlocked {
            return BeginUnlock::AlreadyUnlocked;
        }
        if unlock_started {
            if let Some(l) = listener {
                // Late listener rides along and still gets its terminal
                // notification from the in-flight workflow.
                if let Some(s) = inner.sessions.get_mut(&id) {
                    s.unlock_waiters.push(l);
                }
            }
            return BeginUnlock::InFlight;
        }
        if state != SessionState::RunningLocked {
            return BeginUnlock::NotUnlockable;
        }
        // Parent-before-child: a profile stays locked until its parent is
        // unlocked; the parent's cascade retries it.
        if let Some(parent) = parent {
            let parent_unlocked = inner
                .sessions
                .get(&parent)
                .map(|p| p.state == SessionState::Unlocked)
                .unwrap_or(false);
            if !parent_unlocked {
                return BeginUnlock::NotUnlockable;
            }
        }
        let Some(session) = inner.sessions.get_mut(&id) else {
            return BeginUnlock::NotFound;
        };
        session.unlock_started = true;
        if let Some(l) = listener {
            session.unlock_waiters.push(l);
        }
        BeginUnlock::Ready {
            token: session.token.clone(),
            info: session.info.clone(),
        }
    }

    /// Snapshot the current unlock waiters for progress notifications.
    pub fn unlock_waiters(&self, id: SessionId, token: &SessionToken) -> Vec<Arc<dyn UnlockListener>> {
        let inner = self.inner.lock();
        match inner.sessions.get(&id) {
            Some(s) if s.token.same(token) => s.unlock_waiters.clone(),
            _ => Vec::new(),
        }
    }

    /// Drain the unlock waiters for the terminal notification and clear the
    /// in-flight marker. Stale tokens drain nothing: a replacement session
    /// owns its own waiters.
    pub fn finish_unlock(&self, id: SessionId, token: &SessionToken) -> Vec<Arc<dyn UnlockListener>> {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(&id) {
            Some(s) if s.token.same(token) => {
                s.unlock_started = false;
                std::mem::take(&mut s.unlock_waiters)
            }
            _ => Vec::new(),
        }
    }

    /// Started children of `id` still waiting in `RunningLocked`, for the
    /// parent-unlocked cascade.
    pub fn children_to_cascade(&self, id: SessionId) -> Vec<SessionId> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(child, s)| {
                **child != id
                    && s.info.parent == Some(id)
                    && s.state == SessionState::RunningLocked
            })
            .map(|(child, _)| *child)
            .collect()
    }

    // ---- Stop workflow support -------------------------------------------

    /// Validate a stop request and transition the whole related closure to
    /// `Stopping`, atomically. Callbacks attach to the requested id only.
    pub fn begin_stop(
        &self,
        id: SessionId,
        force: bool,
        stop_callback: Option<StopCallback>,
        key_evicted_callback: Option<KeyEvictedCallback>,
    ) -> Result<StopPlan, StopError> {
        let mut inner = self.inner.lock();
        if id.is_system() {
            return Err(StopError::System);
        }
        if Self::is_current_or_target(&inner, id) && !force {
            return Err(StopError::Current);
        }
        if !inner.sessions.contains_key(&id) {
            return Ok(StopPlan::NotStarted {
                stop_callback,
                key_evicted_callback,
            });
        }

        // Closure of related sessions (same profile group). With `force`,
        // only the requested id stops and related sessions keep running.
        let batch: Vec<SessionId> = if force {
            vec![id]
        } else {
            let root = Self::group_root(&inner, id);
            let related: Vec<SessionId> = inner
                .sessions
                .keys()
                .copied()
                .filter(|&s| Self::group_root(&inner, s) == root)
                .collect();
            if related
                .iter()
                .any(|&s| s != id && Self::is_current_or_target(&inner, s))
            {
                return Err(StopError::RelatedCannotStop);
            }
            related
        };

        let mut tickets = Vec::with_capacity(batch.len());
        let mut stop_callback = stop_callback;
        let mut key_evicted_callback = key_evicted_callback;
        for sid in batch {
            let Some(session) = inner.sessions.get_mut(&sid) else {
                continue;
            };
            if sid == id {
                if let Some(cb) = stop_callback.take() {
                    session.stop_callbacks.push(cb);
                }
                if let Some(cb) = key_evicted_callback.take() {
                    session.key_evicted_callbacks.push(cb);
                }
            }
            if !session.state.is_running() {
                // Already draining: idempotent, callbacks appended above.
                tickets.push(StopTicket {
                    id: sid,
                    token: session.token.clone(),
                    newly_stopping: false,
                });
                continue;
            }
            session.last_state = session.state;
            let from = session.state;
            session.state = SessionState::Stopping;
            let token = session.token.clone();
            let _ = self.events_tx.send(RegistryEvent::StateChanged {
                id: sid,
                from,
                to: SessionState::Stopping,
            });
            tickets.push(StopTicket {
                id: sid,
                token,
                newly_stopping: true,
            });
        }
        Ok(StopPlan::Proceed(tickets))
    }

    /// Final removal step: verify the session is still this incarnation in
    /// `Shutdown`, remove it, settle the eviction policy, and hand back
    /// everything the caller must do outside the mutex.
    pub fn remove_if_shutdown(
        &self,
        id: SessionId,
        token: &SessionToken,
        keep_warm: bool,
        max_unlocked: usize,
    ) -> Option<RemovedSession> {
        let mut inner = self.inner.lock();
        let ready = inner
            .sessions
            .get(&id)
            .map(|s| s.token.same(token) && s.state == SessionState::Shutdown)
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let Some(mut session) = inner.sessions.remove(&id) else {
            return None;
        };
        inner.lru.retain(|&s| s != id);
        if inner.current_id == id {
            // Forced stop of the settled foreground session: focus falls
            // back to the system session.
            tracing::info!(session = %id, "foreground session removed; falling back to system");
            inner.current_id = SessionId::SYSTEM;
        }

        let running = inner
            .sessions
            .values()
            .filter(|s| s.state.is_running())
            .count();
        let key_callbacks = std::mem::take(&mut session.key_evicted_callbacks);
        let evict = match inner.policy.on_stopped(id, keep_warm, running, max_unlocked) {
            Some(victim) if victim == id => Some((id, key_callbacks)),
            Some(victim) => {
                // A colder warm entry loses its key instead; this session's
                // own callbacks wait until its turn comes.
                inner.warm_key_callbacks.insert(id, key_callbacks);
                let owed = inner.warm_key_callbacks.remove(&victim).unwrap_or_default();
                Some((victim, owed))
            }
            None => {
                inner.warm_key_callbacks.insert(id, key_callbacks);
                None
            }
        };
        let pending_starts = inner.pending_starts.take_for(id);
        drop(inner);
        let _ = self.events_tx.send(RegistryEvent::Removed(id));
        Some(RemovedSession {
            info: session.info,
            stop_callbacks: std::mem::take(&mut session.stop_callbacks),
            evict,
            pending_starts,
        })
    }

    /// Eviction-policy application for a stop of an id with no registry
    /// entry: callbacks synthesize immediately, the policy still runs.
    pub fn settle_unstarted_stop(
        &self,
        id: SessionId,
        keep_warm: bool,
        max_unlocked: usize,
        key_evicted_callback: Option<KeyEvictedCallback>,
    ) -> (Option<(SessionId, Vec<KeyEvictedCallback>)>, Vec<PendingStart>) {
        let mut inner = self.inner.lock();
        let running = inner
            .sessions
            .values()
            .filter(|s| s.state.is_running())
            .count();
        let key_callbacks: Vec<KeyEvictedCallback> = key_evicted_callback.into_iter().collect();
        let evict = match inner.policy.on_stopped(id, keep_warm, running, max_unlocked) {
            Some(victim) if victim == id => {
                let mut owed = inner.warm_key_callbacks.remove(&id).unwrap_or_default();
                owed.extend(key_callbacks);
                Some((id, owed))
            }
            Some(victim) => {
                if !key_callbacks.is_empty() {
                    inner
                        .warm_key_callbacks
                        .entry(id)
                        .or_default()
                        .extend(key_callbacks);
                }
                let owed = inner.warm_key_callbacks.remove(&victim).unwrap_or_default();
                Some((victim, owed))
            }
            None => {
                if !key_callbacks.is_empty() {
                    inner
                        .warm_key_callbacks
                        .entry(id)
                        .or_default()
                        .extend(key_callbacks);
                }
                None
            }
        };
        let pending = inner.pending_starts.take_for(id);
        (evict, pending)
    }

    // ---- Switch orchestrator support -------------------------------------

    pub fn set_factory_reset_in_progress(&self, value: bool) {
        self.inner.lock().factory_reset_in_progress = value;
    }

    /// Single-flight admission for a switch request.
    pub fn begin_switch(&self, target: SessionId) -> BeginSwitch {
        let mut inner = self.inner.lock();
        if inner.factory_reset_in_progress {
            return BeginSwitch::FactoryReset;
        }
        if inner
            .sessions
            .get(&target)
            .map(|s| !s.state.is_running())
            .unwrap_or(false)
        {
            return BeginSwitch::TargetDraining;
        }
        if let Some(in_flight) = inner.target_id {
            if in_flight == target {
                // Deduplicate: the in-flight switch already covers this.
                return BeginSwitch::AlreadyForeground;
            }
            inner.switch_queue.push_back(target);
            return BeginSwitch::Queued;
        }
        if inner.current_id == target {
            return BeginSwitch::AlreadyForeground;
        }
        let from = inner.current_id;
        inner.target_id = Some(target);
        inner.switch_generation += 1;
        inner.switch_continued = false;
        BeginSwitch::Proceed {
            from,
            generation: inner.switch_generation,
        }
    }

    pub fn set_switching(&self, id: SessionId, value: bool) {
        if let Some(session) = self.inner.lock().sessions.get_mut(&id) {
            session.switching = value;
        }
    }

    pub fn is_switching(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .sessions
            .get(&id)
            .map(|s| s.switching)
            .unwrap_or(false)
    }

    /// Fan-in continuation, exactly once per switch generation. Flips the
    /// settled `current_id`, refreshes the LRU, clears the target's
    /// switching flag, and names the outgoing sessions that must stop.
    pub fn continue_switch(&self, target: SessionId, generation: u64) -> Option<ContinueSwitch> {
        let mut inner = self.inner.lock();
        if inner.target_id != Some(target)
            || inner.switch_generation != generation
            || inner.switch_continued
        {
            tracing::debug!(%target, generation, "stale switch continuation ignored");
            return None;
        }
        inner.switch_continued = true;
        let from = inner.current_id;
        inner.current_id = target;
        if let Some(session) = inner.sessions.get_mut(&target) {
            session.switching = false;
        }
        if let Some(pos) = inner.lru.iter().position(|&s| s == target) {
            inner.lru.remove(pos);
            inner.lru.push(target);
        }
        let stop_outgoing = inner
            .sessions
            .get(&from)
            .filter(|s| {
                !from.is_system()
                    && from != target
                    && s.state.is_running()
                    && (s.info.ephemeral || s.info.background_restricted)
            })
            .map(|_| vec![from])
            .unwrap_or_default();
        Some(ContinueSwitch { from, stop_outgoing })
    }

    /// Pop the next queued switch target, for retry after a rejected
    /// resubmission.
    pub fn pop_queued_switch(&self) -> Option<SessionId> {
        self.inner.lock().switch_queue.pop_front()
    }

    /// Teardown completion: clear the in-flight target and pop the next
    /// queued switch, if any.
    pub fn complete_switch(&self, target: SessionId, generation: u64) -> Option<CompleteSwitch> {
        let mut inner = self.inner.lock();
        if inner.target_id != Some(target) || inner.switch_generation != generation {
            tracing::debug!(%target, generation, "stale switch completion ignored");
            return None;
        }
        inner.target_id = None;
        let from = inner.current_id;
        let next = inner.switch_queue.pop_front();
        Some(CompleteSwitch { from, next })
    }
}
