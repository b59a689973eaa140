use chrono::{TimeZone, Utc};
use horde_scheduler::models::agent::{Agent, AgentLease, AgentStatus};
use horde_scheduler::models::lease::{LeaseOutcome, LeasePayload, LeaseState};
use horde_scheduler::scheduler::lease_tracker::{lease_action, LeaseAction};

fn lease(state: LeaseState) -> AgentLease {
    AgentLease {
        id: "lease-1".into(),
        name: "compile editor".into(),
        state,
        outcome: LeaseOutcome::Unspecified,
        stream_id: None,
        pool_id: None,
        log_id: None,
        start_time: Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap(),
        expiry_time: None,
        payload: LeasePayload::new("test.Payload", b"x".to_vec()),
    }
}

#[test]
fn states_only_move_forward() {
    use LeaseState::{Active, Cancelled, Completed, Pending};

    assert!(Pending.can_advance_to(Active));
    assert!(Pending.can_advance_to(Cancelled));
    assert!(Pending.can_advance_to(Completed));
    assert!(Active.can_advance_to(Completed));
    assert!(Active.can_advance_to(Cancelled));

    assert!(!Active.can_advance_to(Pending));
    assert!(!Active.can_advance_to(Active));
    assert!(!Completed.can_advance_to(Active));
    assert!(!Cancelled.can_advance_to(Completed));
}

#[test]
fn terminal_states() {
    assert!(!LeaseState::Pending.is_terminal());
    assert!(!LeaseState::Active.is_terminal());
    assert!(LeaseState::Cancelled.is_terminal());
    assert!(LeaseState::Completed.is_terminal());
}

#[test]
fn pending_lease_reported_active_is_promoted() {
    let attached = lease(LeaseState::Pending);
    let report = attached.reported(LeaseState::Active, LeaseOutcome::Unspecified);
    assert_eq!(lease_action(&attached, Some(&report)), LeaseAction::Promote);
}

#[test]
fn active_lease_reported_active_is_kept() {
    let attached = lease(LeaseState::Active);
    let report = attached.reported(LeaseState::Active, LeaseOutcome::Unspecified);
    assert_eq!(lease_action(&attached, Some(&report)), LeaseAction::Keep);
}

#[test]
fn active_lease_reported_pending_is_not_demoted() {
    let attached = lease(LeaseState::Active);
    let report = attached.reported(LeaseState::Pending, LeaseOutcome::Unspecified);
    assert_eq!(lease_action(&attached, Some(&report)), LeaseAction::Keep);
}

#[test]
fn unreported_lease_is_kept() {
    assert_eq!(lease_action(&lease(LeaseState::Pending), None), LeaseAction::Keep);
    assert_eq!(lease_action(&lease(LeaseState::Active), None), LeaseAction::Keep);
}

#[test]
fn completed_report_removes_with_reported_outcome() {
    let attached = lease(LeaseState::Active);
    let success = attached.reported(LeaseState::Completed, LeaseOutcome::Success);
    let failed = attached.reported(LeaseState::Completed, LeaseOutcome::Failed);

    assert_eq!(
        lease_action(&attached, Some(&success)),
        LeaseAction::Remove(LeaseOutcome::Success)
    );
    assert_eq!(
        lease_action(&attached, Some(&failed)),
        LeaseAction::Remove(LeaseOutcome::Failed)
    );
}

#[test]
fn cancelled_report_without_outcome_counts_as_cancelled() {
    let attached = lease(LeaseState::Pending);
    let report = attached.reported(LeaseState::Cancelled, LeaseOutcome::Unspecified);
    assert_eq!(
        lease_action(&attached, Some(&report)),
        LeaseAction::Remove(LeaseOutcome::Cancelled)
    );
}

#[test]
fn cancelled_lease_stays_while_agent_still_runs_it() {
    let attached = lease(LeaseState::Cancelled);
    let running = attached.reported(LeaseState::Active, LeaseOutcome::Unspecified);
    assert_eq!(lease_action(&attached, Some(&running)), LeaseAction::Keep);
}

#[test]
fn cancelled_lease_is_removed_once_agent_lets_go() {
    let attached = lease(LeaseState::Cancelled);
    let finished = attached.reported(LeaseState::Completed, LeaseOutcome::Success);

    assert_eq!(
        lease_action(&attached, None),
        LeaseAction::Remove(LeaseOutcome::Cancelled)
    );
    assert_eq!(
        lease_action(&attached, Some(&finished)),
        LeaseAction::Remove(LeaseOutcome::Cancelled)
    );
}

#[test]
fn only_healthy_idle_enabled_agents_accept_work() {
    let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
    let mut agent = Agent::new("agent-1");
    agent.status = AgentStatus::Ok;
    assert!(!agent.can_accept_work(), "no session");

    agent.session_id = Some("s1".into());
    agent.session_expires_at = Some(now + chrono::Duration::minutes(5));
    assert!(agent.can_accept_work());
    assert!(agent.is_session_valid("s1", now));
    assert!(!agent.is_session_valid("s2", now));
    assert!(!agent.is_session_valid("s1", now + chrono::Duration::minutes(5)));

    agent.status = AgentStatus::Unhealthy;
    assert!(!agent.can_accept_work());

    agent.status = AgentStatus::Ok;
    agent.enabled = false;
    assert!(!agent.can_accept_work());

    agent.enabled = true;
    agent.leases.push(lease(LeaseState::Pending));
    assert!(!agent.can_accept_work());
}
