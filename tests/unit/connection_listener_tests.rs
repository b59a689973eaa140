use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use horde_scheduler::clock::{Clock, ManualClock};
use horde_scheduler::scheduler::connection_listeners::ConnectionListenerRegistry;
use horde_scheduler::task_source::ConnectionLostCallback;
use horde_scheduler::AppError;

fn registry() -> (ConnectionListenerRegistry, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap(),
    ));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    (
        ConnectionListenerRegistry::new(dyn_clock, Duration::seconds(20)),
        clock,
    )
}

fn counting(counter: &Arc<AtomicUsize>) -> ConnectionLostCallback {
    let counter = Arc::clone(counter);
    Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn reported_lease_keeps_its_listener() {
    let (registry, _clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));

    let count = registry.begin_update("agent-1", ["lease-1"]).expect("begin");
    registry.end_update("agent-1");

    assert_eq!(count, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(registry.registered("agent-1"), 1);
}

#[test]
fn unreported_lease_fires_exactly_once() {
    let (registry, _clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));
    registry.register("agent-1", "lease-2", counting(&fired));

    let count = registry.begin_update("agent-1", ["lease-2"]).expect("begin");
    registry.end_update("agent-1");
    assert_eq!(count, 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    registry.begin_update("agent-1", ["lease-2"]).expect("begin");
    registry.end_update("agent-1");
    assert_eq!(fired.load(Ordering::SeqCst), 1, "lease-1 must not fire twice");
    assert_eq!(registry.registered("agent-1"), 1);
}

#[test]
fn unregistered_lease_never_fires() {
    let (registry, clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));
    registry.unregister("agent-1", "lease-1");

    registry.begin_update("agent-1", []).expect("begin");
    registry.end_update("agent-1");
    clock.advance(Duration::minutes(5));
    registry.expire_idle().expect("expire");

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(registry.registered("agent-1"), 0);
}

#[test]
fn silent_agent_fires_after_idle_deadline() {
    let (registry, clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));
    registry.end_update("agent-1");

    clock.advance(Duration::seconds(19));
    assert_eq!(registry.expire_idle().expect("expire"), 0);

    clock.advance(Duration::seconds(1));
    assert_eq!(registry.expire_idle().expect("expire"), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.registered("agent-1"), 0);

    clock.advance(Duration::minutes(1));
    assert_eq!(registry.expire_idle().expect("expire"), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn update_in_progress_suspends_deadline() {
    let (registry, clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));
    registry.end_update("agent-1");

    registry.begin_update("agent-1", ["lease-1"]).expect("begin");
    clock.advance(Duration::minutes(10));
    assert_eq!(registry.expire_idle().expect("expire"), 0, "long poll in flight");

    registry.end_update("agent-1");
    clock.advance(Duration::seconds(20));
    assert_eq!(registry.expire_idle().expect("expire"), 1);
}

#[test]
fn listener_without_deadline_is_not_expired() {
    let (registry, clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register("agent-1", "lease-1", counting(&fired));

    clock.advance(Duration::hours(1));
    assert_eq!(registry.expire_idle().expect("expire"), 0);
}

#[test]
fn agents_are_tracked_independently() {
    let (registry, _clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    for agent in ["agent-1", "agent-2", "agent-3"] {
        registry.register(agent, "lease-1", counting(&fired));
    }

    registry.begin_update("agent-2", []).expect("begin");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.registered("agent-1"), 1);
    assert_eq!(registry.registered("agent-2"), 0);
    assert_eq!(registry.registered("agent-3"), 1);
}

#[test]
fn callback_failure_is_reported_after_running_all_callbacks() {
    let (registry, _clock) = registry();
    let fired = Arc::new(AtomicUsize::new(0));
    registry.register(
        "agent-1",
        "lease-1",
        Box::new(|| Err(AppError::TaskSource("source offline".into()))),
    );
    registry.register("agent-1", "lease-2", counting(&fired));

    let result = registry.begin_update("agent-1", []);

    assert!(matches!(result, Err(AppError::Listener(msg)) if msg.contains("lease-1")));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(registry.registered("agent-1"), 0);
}
