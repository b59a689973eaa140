use std::time::Duration;

use horde_scheduler::models::agent::Agent;
use horde_scheduler::models::lease::LeasePayload;
use horde_scheduler::task_source::queue::{QueueTaskSource, QueuedTask};
use horde_scheduler::task_source::{TaskSource, TaskSubscription};

const PAYLOAD_TYPE: &str = "test.QueuedTask";

fn source() -> QueueTaskSource {
    QueueTaskSource::new("queue", PAYLOAD_TYPE)
}

/// Whether the subscription has an answer right now.
async fn has_answer(subscription: &mut TaskSubscription) -> bool {
    tokio::time::timeout(Duration::from_millis(20), subscription.next_offer())
        .await
        .is_ok()
}

#[tokio::test]
async fn pending_task_is_offered_immediately() {
    let source = source();
    source.enqueue(QueuedTask::new("lease-1", "compile").with_data(b"body".to_vec()));
    let agent = Agent::new("agent-1");

    let mut subscription = source.subscribe(&agent).await.expect("subscribe");
    assert_eq!(subscription.source(), "queue");
    let offer = subscription.next_offer().await.expect("offer");

    assert_eq!(offer.id, "lease-1");
    assert_eq!(offer.name, "compile");
    assert_eq!(offer.payload, LeasePayload::new(PAYLOAD_TYPE, b"body".to_vec()));
    assert!(offer.on_connection_lost.is_none());
    assert_eq!(source.pending_len(), 0);
}

#[tokio::test]
async fn accepted_offer_is_not_requeued() {
    let source = source();
    source.enqueue(QueuedTask::new("lease-1", "compile"));
    let agent = Agent::new("agent-1");

    let mut subscription = source.subscribe(&agent).await.expect("subscribe");
    subscription.next_offer().await.expect("offer");
    subscription.accept();
    assert!(subscription.is_accepted());
    drop(subscription);

    assert_eq!(source.pending_len(), 0);
}

#[tokio::test]
async fn unaccepted_offer_goes_back_to_the_front() {
    let source = source();
    source.enqueue(QueuedTask::new("lease-1", "first"));
    source.enqueue(QueuedTask::new("lease-2", "second"));
    let agent = Agent::new("agent-1");

    let mut subscription = source.subscribe(&agent).await.expect("subscribe");
    assert_eq!(subscription.next_offer().await.expect("offer").id, "lease-1");
    drop(subscription);
    assert_eq!(source.pending_len(), 2);

    let mut again = source.subscribe(&agent).await.expect("subscribe");
    assert_eq!(again.next_offer().await.expect("offer").id, "lease-1");
}

#[tokio::test]
async fn waiting_subscription_receives_later_task() {
    let source = source();
    let agent = Agent::new("agent-1");

    let mut subscription = source.subscribe(&agent).await.expect("subscribe");
    assert_eq!(source.waiting_len(), 1);
    assert!(!has_answer(&mut subscription).await);

    source.enqueue(QueuedTask::new("lease-1", "compile"));
    assert_eq!(source.pending_len(), 0, "handed straight to the waiter");

    let offer = tokio::time::timeout(Duration::from_secs(5), subscription.next_offer())
        .await
        .expect("offer arrives")
        .expect("offer");
    assert_eq!(offer.id, "lease-1");
}

#[tokio::test]
async fn disposed_waiter_is_skipped() {
    let source = source();
    let agent = Agent::new("agent-1");

    let subscription = source.subscribe(&agent).await.expect("subscribe");
    drop(subscription);
    assert_eq!(source.waiting_len(), 0);

    source.enqueue(QueuedTask::new("lease-1", "compile"));
    assert_eq!(source.pending_len(), 1);
}

#[tokio::test]
async fn delivered_but_unaccepted_task_is_requeued() {
    let source = source();
    let agent = Agent::new("agent-1");

    let subscription = source.subscribe(&agent).await.expect("subscribe");
    source.enqueue(QueuedTask::new("lease-1", "compile"));
    drop(subscription);

    assert_eq!(source.pending_len(), 1);
}

#[tokio::test]
async fn tracked_task_carries_connection_lost_callback() {
    let source = source();
    source.enqueue(QueuedTask::new("lease-1", "remote exec").tracking_connection());
    let agent = Agent::new("agent-1");

    let mut subscription = source.subscribe(&agent).await.expect("subscribe");
    let offer = subscription.next_offer().await.expect("offer");
    let callback = offer.on_connection_lost.expect("callback requested");

    callback().expect("callback succeeds");
    assert_eq!(source.connection_lost(), ["lease-1"]);
}

#[tokio::test]
async fn abort_is_recorded() {
    let source = source();
    let agent = Agent::new("agent-1");
    let payload = LeasePayload::new(PAYLOAD_TYPE, Vec::new());

    source
        .abort_task(&agent, "lease-9", &payload)
        .await
        .expect("abort");
    assert_eq!(source.aborted(), ["lease-9"]);
}
