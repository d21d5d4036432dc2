//! End-to-end lifecycle tests: full start / unlock / switch / stop journeys
//! over the in-process collaborators.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{sleep, Duration};

use sessiond::config::SessiondConfig;
use sessiond::orchestrator::{Orchestrator, StartMode};
use sessiond::registry::RunningFilter;
use sessiond::services::{AccountInfo, LifecycleEvent, LocalServices, StorageService};
use sessiond::state::{SessionId, SessionState};
use sessiond::stop::{StopError, StopOutcome, StopRequest};
use sessiond::switch::{SwitchAck, SwitchObserver};
use sessiond::unlock::UnlockListener;

async fn settle() {
    for _ in 0..30 {
        sleep(Duration::from_millis(1)).await;
    }
}

fn services() -> LocalServices {
    let services = LocalServices::new();
    services
        .accounts
        .insert(SessionId::SYSTEM, AccountInfo::full_session());
    services
}

fn account(services: &LocalServices, id: u32, info: AccountInfo) {
    services.accounts.insert(SessionId(id), info);
}

#[derive(Default)]
struct Recorder {
    finished: Mutex<Vec<(SessionId, bool)>>,
}

impl UnlockListener for Recorder {
    fn on_finished(&self, id: SessionId, unlocked: bool) {
        self.finished.lock().push((id, unlocked));
    }
}

struct AckObserver {
    completions: Mutex<Vec<SessionId>>,
}

impl SwitchObserver for AckObserver {
    fn on_switching(&self, _from: SessionId, _to: SessionId, ack: SwitchAck) {
        ack.ack();
    }

    fn on_switch_complete(&self, to: SessionId) {
        self.completions.lock().push(to);
    }
}

#[tokio::test]
async fn full_session_journey() {
    let services = services();
    account(&services, 10, AccountInfo::full_session());
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);
    settle().await;

    // Start in the background, wait for the full boot-and-unlock march.
    let listener = Arc::new(Recorder::default());
    assert!(orch.start(SessionId(10), StartMode::Background, Some(listener.clone())));
    settle().await;
    assert_eq!(orch.session_state(SessionId(10)), Some(SessionState::Unlocked));
    assert_eq!(listener.finished.lock().as_slice(), &[(SessionId(10), true)]);

    // Bring it to the foreground.
    orch.switch_to(SessionId(10)).unwrap();
    settle().await;
    assert_eq!(orch.current_session_id(), SessionId(10));

    // Switch back, then stop it.
    orch.switch_to(SessionId::SYSTEM).unwrap();
    settle().await;
    let outcome = Arc::new(Mutex::new(None));
    let seen = outcome.clone();
    orch.stop(
        SessionId(10),
        StopRequest::new().on_stopped(Box::new(move |_, o| *seen.lock() = Some(o))),
    )
    .unwrap();
    settle().await;

    assert_eq!(*outcome.lock(), Some(StopOutcome::Stopped));
    assert!(orch.session_state(SessionId(10)).is_none());
    assert!(!services.storage.is_unlocked(SessionId(10)));

    // Lifecycle broadcasts arrived in machine order.
    let events = services.broadcasts.events();
    let pos = |e: &LifecycleEvent| events.iter().position(|x| x == e);
    let started = pos(&LifecycleEvent::Started(SessionId(10))).unwrap();
    let unlocking = pos(&LifecycleEvent::Unlocking(SessionId(10))).unwrap();
    let unlocked = pos(&LifecycleEvent::Unlocked(SessionId(10))).unwrap();
    let stopping = pos(&LifecycleEvent::Stopping(SessionId(10))).unwrap();
    let shutdown = pos(&LifecycleEvent::Shutdown(SessionId(10))).unwrap();
    assert!(started < unlocking);
    assert!(unlocking < unlocked);
    assert!(unlocked < stopping);
    assert!(stopping < shutdown);
}

#[tokio::test]
async fn foreground_reports_target_during_switch_and_never_queued() {
    let services = services();
    account(&services, 10, AccountInfo::full_session());
    account(&services, 11, AccountInfo::full_session());
    let config = SessiondConfig {
        switch_timeout_ms: 50,
        ..Default::default()
    };
    let orch = Orchestrator::with_local_services(config, &services);
    // An observer that never acks holds the switch in flight for 50ms.
    struct Silent;
    impl SwitchObserver for Silent {
        fn on_switching(&self, _f: SessionId, _t: SessionId, _a: SwitchAck) {}
    }
    orch.register_switch_observer("silent", Arc::new(Silent));

    orch.switch_to(SessionId(10)).unwrap();
    orch.switch_to(SessionId(11)).unwrap();

    // While 10 is in flight and 11 queued, the effective foreground is 10.
    assert_eq!(orch.current_session_id(), SessionId(10));
    sleep(Duration::from_millis(200)).await;
    settle().await;

    // Both switches landed, in order.
    assert_eq!(orch.current_session_id(), SessionId(11));
}

#[tokio::test]
async fn switch_completions_are_fifo() {
    let services = services();
    for id in [10, 11, 12] {
        account(&services, id, AccountInfo::full_session());
    }
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);
    let observer = Arc::new(AckObserver {
        completions: Mutex::new(Vec::new()),
    });
    orch.register_switch_observer("fifo", observer.clone());

    orch.switch_to(SessionId(10)).unwrap();
    orch.switch_to(SessionId(11)).unwrap();
    orch.switch_to(SessionId(12)).unwrap();
    settle().await;

    assert_eq!(
        observer.completions.lock().as_slice(),
        &[SessionId(10), SessionId(11), SessionId(12)]
    );
    assert_eq!(orch.current_session_id(), SessionId(12));
}

#[tokio::test]
async fn profile_group_runs_and_stops_together() {
    let services = services();
    account(&services, 10, AccountInfo::full_session());
    account(&services, 11, AccountInfo::profile_of(SessionId(10)));
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

    orch.start(SessionId(10), StartMode::Background, None);
    orch.start(SessionId(11), StartMode::Background, None);
    settle().await;

    // Parent unlocked first, then the profile cascaded.
    assert_eq!(orch.session_state(SessionId(10)), Some(SessionState::Unlocked));
    assert_eq!(orch.session_state(SessionId(11)), Some(SessionState::Unlocked));

    // Switch to the parent: the profile shows up in its running group.
    orch.switch_to(SessionId(10)).unwrap();
    settle().await;
    let mut group = orch.current_profile_ids();
    group.sort();
    assert_eq!(group, vec![SessionId(10), SessionId(11)]);

    // Stopping the parent while foreground is rejected; after switching
    // away, stopping the profile drains the whole group.
    assert_eq!(
        orch.stop(SessionId(10), StopRequest::new()),
        Err(StopError::Current)
    );
    orch.switch_to(SessionId::SYSTEM).unwrap();
    settle().await;
    orch.stop(SessionId(11), StopRequest::new()).unwrap();
    settle().await;
    assert!(orch.session_state(SessionId(10)).is_none());
    assert!(orch.session_state(SessionId(11)).is_none());
}

#[tokio::test]
async fn ephemeral_foreground_session_vanishes_on_switch_away() {
    let services = services();
    account(&services, 10, AccountInfo::full_session().ephemeral());
    account(&services, 11, AccountInfo::full_session());
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

    orch.switch_to(SessionId(10)).unwrap();
    settle().await;
    assert_eq!(orch.current_session_id(), SessionId(10));

    orch.switch_to(SessionId(11)).unwrap();
    settle().await;

    // The outgoing ephemeral session was force-stopped and its account
    // deleted.
    assert!(orch.session_state(SessionId(10)).is_none());
    assert!(!services.accounts.contains(SessionId(10)));
    assert!(!services.storage.is_unlocked(SessionId(10)));
}

#[tokio::test]
async fn delayed_locking_budget_worked_example() {
    let services = services();
    for id in [10, 11] {
        account(&services, id, AccountInfo::full_session());
    }
    // Budget 3: the system session plus two warm entries fit exactly.
    let config = SessiondConfig {
        delayed_locking: true,
        max_unlocked: 3,
        ..Default::default()
    };
    let orch = Orchestrator::with_local_services(config, &services);

    for id in [10, 11] {
        orch.start(SessionId(id), StartMode::Background, None);
    }
    settle().await;
    for id in [10, 11] {
        orch.stop(SessionId(id), StopRequest::new().allow_delayed_locking())
            .unwrap();
        settle().await;
    }

    // 1 running (system) + 2 warm = 3: both keys stay warm.
    assert!(services.storage.is_unlocked(SessionId(10)));
    assert!(services.storage.is_unlocked(SessionId(11)));

    // Restart 10 and stop it again: still within budget, 10 moves to the
    // warm front rather than evicting 11.
    orch.start(SessionId(10), StartMode::Background, None);
    settle().await;
    orch.stop(SessionId(10), StopRequest::new().allow_delayed_locking())
        .unwrap();
    settle().await;
    assert!(services.storage.is_unlocked(SessionId(10)));
    assert!(services.storage.is_unlocked(SessionId(11)));
}

#[tokio::test]
async fn key_evicted_callback_fires_for_the_evicted_session() {
    let services = services();
    for id in [10, 11] {
        account(&services, id, AccountInfo::full_session());
    }
    let config = SessiondConfig {
        delayed_locking: true,
        max_unlocked: 2,
        ..Default::default()
    };
    let orch = Orchestrator::with_local_services(config, &services);

    let evicted = Arc::new(Mutex::new(Vec::new()));
    for id in [10, 11] {
        orch.start(SessionId(id), StartMode::Background, None);
        settle().await;
        let seen = evicted.clone();
        orch.stop(
            SessionId(id),
            StopRequest::new()
                .allow_delayed_locking()
                .on_key_evicted(Box::new(move |victim| seen.lock().push(victim))),
        )
        .unwrap();
        settle().await;
    }

    // Budget 2 = system + one warm entry: stopping 11 evicted the colder
    // 10, firing the callback 10's stop registered.
    assert_eq!(evicted.lock().as_slice(), &[SessionId(10)]);
    assert!(!services.storage.is_unlocked(SessionId(10)));
    assert!(services.storage.is_unlocked(SessionId(11)));
}

#[tokio::test]
async fn restart_race_ends_with_a_running_session() {
    let services = services();
    account(&services, 10, AccountInfo::full_session());
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

    orch.start(SessionId(10), StartMode::Background, None);
    settle().await;

    // Stop and immediately re-start; the start is queued and replayed.
    orch.stop(SessionId(10), StopRequest::new()).unwrap();
    let listener = Arc::new(Recorder::default());
    assert!(orch.start(SessionId(10), StartMode::Background, Some(listener.clone())));
    settle().await;

    assert_eq!(orch.session_state(SessionId(10)), Some(SessionState::Unlocked));
    assert_eq!(listener.finished.lock().as_slice(), &[(SessionId(10), true)]);
    // The old incarnation completed its whole drain first.
    assert_eq!(
        services
            .broadcasts
            .count(|e| matches!(e, LifecycleEvent::Shutdown(id) if *id == SessionId(10))),
        1
    );
    assert_eq!(
        services
            .broadcasts
            .count(|e| matches!(e, LifecycleEvent::Started(id) if *id == SessionId(10))),
        2
    );
}

#[tokio::test]
async fn background_restricted_session_is_stopped_and_locked_on_switch_away() {
    let services = services();
    account(
        &services,
        10,
        AccountInfo::full_session().background_restricted(),
    );
    account(&services, 11, AccountInfo::full_session());
    // Delayed locking on: restricted sessions still never stay warm.
    let config = SessiondConfig {
        delayed_locking: true,
        ..Default::default()
    };
    let orch = Orchestrator::with_local_services(config, &services);

    orch.switch_to(SessionId(10)).unwrap();
    settle().await;
    orch.switch_to(SessionId(11)).unwrap();
    settle().await;

    assert!(orch.session_state(SessionId(10)).is_none());
    assert!(!services.storage.is_unlocked(SessionId(10)));
}

#[tokio::test]
async fn running_filters_follow_the_state_machine() {
    let services = services();
    account(&services, 10, AccountInfo::full_session());
    services.storage.fail_unlock_for(SessionId(10));
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

    orch.start(SessionId(10), StartMode::Background, None);
    settle().await;

    // Stuck in RunningLocked.
    assert!(orch.is_running(SessionId(10), RunningFilter::Any));
    assert!(orch.is_running(SessionId(10), RunningFilter::Locked));
    assert!(!orch.is_running(SessionId(10), RunningFilter::Unlocked));
    assert!(!orch.is_running(SessionId(10), RunningFilter::UnlockedOrUnlocking));

    services.storage.clear_failures();
    orch.unlock(SessionId(10), None).await;
    settle().await;
    assert!(orch.is_running(SessionId(10), RunningFilter::Unlocked));
}

#[tokio::test]
async fn started_ids_track_selection_recency() {
    let services = services();
    for id in [10, 11] {
        account(&services, id, AccountInfo::full_session());
    }
    let orch = Orchestrator::with_local_services(SessiondConfig::default(), &services);

    orch.start(SessionId(10), StartMode::Background, None);
    orch.start(SessionId(11), StartMode::Background, None);
    settle().await;
    assert_eq!(
        orch.started_session_ids(),
        vec![SessionId::SYSTEM, SessionId(10), SessionId(11)]
    );

    orch.switch_to(SessionId(10)).unwrap();
    settle().await;
    assert_eq!(
        orch.started_session_ids(),
        vec![SessionId::SYSTEM, SessionId(11), SessionId(10)]
    );
}
