use chrono::Duration;

use horde_scheduler::config::SessionConfig;
use horde_scheduler::models::agent::{AgentCapabilities, AgentStatus};
use horde_scheduler::models::lease::LeaseOutcome;
use horde_scheduler::AppError;

use super::test_helpers::{harness, harness_with, start_time};

#[tokio::test]
async fn first_session_registers_agent() {
    let h = harness().await;

    let agent = h.connect("agent-1").await;

    assert!(agent.enabled);
    assert_eq!(agent.status, AgentStatus::Ok);
    assert_eq!(agent.version.as_deref(), Some("5.4.0"));
    assert_eq!(agent.capabilities.properties, vec!["OS=Linux".to_owned()]);
    assert_eq!(agent.session_expires_at, Some(start_time() + Duration::seconds(300)));
    assert!(agent.leases.is_empty());

    let session_id = agent.session_id.clone().expect("session attached");
    let session = h
        .service
        .ledgers()
        .sessions
        .get(&session_id)
        .await
        .expect("query")
        .expect("session recorded");
    assert_eq!(session.agent_id, "agent-1");
    assert_eq!(session.start_time, start_time());
    assert!(session.finish_time.is_none());
}

#[tokio::test]
async fn new_session_replaces_live_one_and_fails_its_leases() {
    let h = harness().await;
    let first = h.connect("agent-1").await;
    let first = h.assign(&first, "lease-1").await;
    let old_session = first.session_id.clone().expect("session");

    h.clock.advance(Duration::seconds(10));
    let second = h.connect("agent-1").await;

    assert_ne!(second.session_id.as_deref(), Some(old_session.as_str()));
    assert!(second.leases.is_empty());
    assert_eq!(h.queue.aborted(), vec!["lease-1".to_owned()]);

    let lease = h
        .service
        .ledgers()
        .leases
        .get("lease-1")
        .await
        .expect("query")
        .expect("lease recorded");
    assert_eq!(lease.outcome, LeaseOutcome::Failed);
    assert_eq!(lease.finish_time, Some(start_time() + Duration::seconds(10)));

    let sessions = h
        .service
        .ledgers()
        .sessions
        .list_for_agent("agent-1")
        .await
        .expect("query");
    assert_eq!(sessions.len(), 2);
    let old = sessions.iter().find(|s| s.id == old_session).expect("old session");
    assert_eq!(old.finish_time, Some(start_time() + Duration::seconds(10)));
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let h = harness().await;
    let agent = h.connect("agent-1").await;
    let session_id = agent.session_id.clone().expect("session");

    h.clock.advance(Duration::seconds(5));
    let ended = h.service.terminate_session("agent-1").await.expect("terminate");
    assert!(!ended.has_session());
    assert!(ended.session_expires_at.is_none());

    h.clock.advance(Duration::seconds(5));
    let again = h.service.terminate_session("agent-1").await.expect("terminate again");
    assert_eq!(again, ended);

    let session = h
        .service
        .ledgers()
        .sessions
        .get(&session_id)
        .await
        .expect("query")
        .expect("session");
    assert_eq!(session.finish_time, Some(start_time() + Duration::seconds(5)));
}

#[tokio::test]
async fn terminating_unknown_agent_is_not_found() {
    let h = harness().await;
    let result = h.service.terminate_session("ghost").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn expired_session_fails_leases_at_expiry_time() {
    let h = harness().await;
    let agent = h.connect("agent-1").await;
    let agent = h.assign(&agent, "lease-1").await;
    let session_id = agent.session_id.clone().expect("session");
    let expiry = start_time() + Duration::seconds(300);

    h.clock.advance(Duration::seconds(400));
    let terminated = h.service.terminate_expired_sessions().await.expect("sweep");
    assert_eq!(terminated, 1);

    let stored = h.service.agent("agent-1").await.expect("query").expect("agent");
    assert!(!stored.has_session());
    assert!(stored.leases.is_empty());
    assert_eq!(h.queue.aborted(), vec!["lease-1".to_owned()]);

    let lease = h
        .service
        .ledgers()
        .leases
        .get("lease-1")
        .await
        .expect("query")
        .expect("lease");
    assert_eq!(lease.outcome, LeaseOutcome::Failed);
    assert_eq!(lease.finish_time, Some(expiry));

    let session = h
        .service
        .ledgers()
        .sessions
        .get(&session_id)
        .await
        .expect("query")
        .expect("session");
    assert_eq!(session.finish_time, Some(expiry));
}

#[tokio::test]
async fn live_sessions_survive_the_sweep() {
    let h = harness().await;
    h.connect("agent-1").await;

    h.clock.advance(Duration::seconds(299));
    assert_eq!(h.service.terminate_expired_sessions().await.expect("sweep"), 0);

    let stored = h.service.agent("agent-1").await.expect("query").expect("agent");
    assert!(stored.has_session());
}

#[tokio::test]
async fn sweep_pages_through_every_expired_agent() {
    let config = SessionConfig {
        expiry_page_size: 2,
        ..SessionConfig::default()
    };
    let h = harness_with(config, Vec::new()).await;
    for index in 0..5 {
        h.connect(&format!("agent-{index}")).await;
    }

    h.clock.advance(Duration::seconds(301));
    assert_eq!(h.service.terminate_expired_sessions().await.expect("sweep"), 5);
    assert_eq!(h.service.terminate_expired_sessions().await.expect("sweep"), 0);

    for index in 0..5 {
        let agent = h
            .service
            .agent(&format!("agent-{index}"))
            .await
            .expect("query")
            .expect("agent");
        assert!(!agent.has_session());
    }
}

#[tokio::test]
async fn unrecorded_session_is_detached_again() {
    let h = harness().await;
    sqlx::query("DROP TABLE session")
        .execute(h.db.as_ref())
        .await
        .expect("drop session table");

    let result = h
        .service
        .create_session("agent-1", AgentStatus::Ok, AgentCapabilities::default(), None)
        .await;
    assert!(matches!(result, Err(AppError::Db(_))));

    let stored = h.service.agent("agent-1").await.expect("query").expect("agent registered");
    assert!(!stored.has_session());
    assert!(stored.session_expires_at.is_none());
}
