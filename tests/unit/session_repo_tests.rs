use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use horde_scheduler::models::agent::AgentCapabilities;
use horde_scheduler::models::session::Session;
use horde_scheduler::persistence::{db, session_repo::SessionRepo};

/// In-memory `connect_memory()` creates all three ledger tables.
#[tokio::test]
async fn in_memory_connect_creates_ledger_tables() {
    let pool = db::connect_memory()
        .await
        .expect("in-memory connect should succeed");

    for table in ["agent", "session", "lease"] {
        let query = format!("SELECT COUNT(*) AS cnt FROM {table}");
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn on_disk_database_is_created_with_parent_dirs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("nested").join("scheduler.db");

    let pool = db::connect(&path).await.expect("connect");
    assert!(path.exists());
    pool.close().await;

    // Re-running the bootstrap on an existing file is harmless.
    let pool = db::connect(&path).await.expect("reconnect");
    pool.close().await;
}

#[tokio::test]
async fn add_get_and_finish_once() {
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db connect")));
    let start = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();

    let session = Session::new(
        "agent-1".into(),
        start,
        AgentCapabilities::new(["OS=Linux"]),
        Some("5.4.0".into()),
    );
    repo.add(&session).await.expect("add");

    let fetched = repo.get(&session.id).await.expect("get").expect("exists");
    assert_eq!(fetched, session);
    assert!(fetched.finish_time.is_none());

    let finish = start + Duration::minutes(5);
    assert!(repo.try_finish(&session.id, finish).await.expect("finish"));
    assert!(
        !repo
            .try_finish(&session.id, finish + Duration::minutes(1))
            .await
            .expect("finish"),
        "a finished session is never rewritten"
    );

    let fetched = repo.get(&session.id).await.expect("get").expect("exists");
    assert_eq!(fetched.finish_time, Some(finish));
}

#[tokio::test]
async fn finishing_unknown_session_returns_false() {
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db connect")));
    let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
    assert!(!repo.try_finish("ghost", now).await.expect("finish"));
}

#[tokio::test]
async fn lists_sessions_of_one_agent_oldest_first() {
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db connect")));
    let start = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();

    let second = Session::new("agent-1".into(), start + Duration::hours(1), AgentCapabilities::default(), None);
    let first = Session::new("agent-1".into(), start, AgentCapabilities::default(), None);
    let other = Session::new("agent-2".into(), start, AgentCapabilities::default(), None);
    for session in [&second, &first, &other] {
        repo.add(session).await.expect("add");
    }

    let listed = repo.list_for_agent("agent-1").await.expect("list");
    let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, [first.id, second.id]);
}
