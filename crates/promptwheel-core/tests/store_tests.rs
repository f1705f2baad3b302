//! Store-level lifecycle tests: the ticket status DAG, lease exclusivity
//! and reclaim, the retry ladder, and run/step bookkeeping.

use chrono::Duration;
use promptwheel_core::store::{Store, StoreConflict};
use promptwheel_core::types::{
    LeaseStatus, RunStatus, RunType, StepKind, StepStatus, Ticket, TicketStatus,
};

fn open_store() -> Store {
    Store::open_in_memory().expect("open in-memory store")
}

fn make_ticket(store: &Store, project_id: &str, status: TicketStatus, max_retries: i64) -> Ticket {
    let now = chrono::Utc::now();
    let ticket = Ticket {
        id: format!("tck_{}", uuid_like()),
        project_id: project_id.to_string(),
        title: "Tighten lease reclaim".into(),
        description: "desc".into(),
        status,
        priority: 10,
        shard: "src".into(),
        category: "fix".into(),
        allowed_paths: vec!["src/**".into()],
        forbidden_paths: vec![],
        verification_commands: vec!["true".into()],
        max_retries,
        retry_count: 0,
        created_at: now,
        updated_at: now,
    };
    store.insert_ticket(&ticket).expect("insert ticket");
    ticket
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("{:08x}", NEXT.fetch_add(1, Ordering::Relaxed))
}

fn setup() -> (Store, String) {
    let store = open_store();
    let project = store.upsert_project("demo", "", "/repo").expect("project");
    (store, project.id)
}

// ── Status DAG ───────────────────────────────────────────────────────────

#[test]
fn backlog_approval_walks_the_dag() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Backlog, 2);

    store
        .transition_ticket(&ticket.id, TicketStatus::Backlog, TicketStatus::Ready)
        .expect("approve");
    let loaded = store.get_ticket(&ticket.id).expect("get").expect("exists");
    assert_eq!(loaded.status, TicketStatus::Ready);
}

#[test]
fn transition_from_wrong_status_is_a_store_conflict() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 2);

    let err = store
        .transition_ticket(&ticket.id, TicketStatus::Backlog, TicketStatus::Ready)
        .expect_err("must conflict");
    let conflict = err.downcast_ref::<StoreConflict>().expect("typed conflict");
    assert_eq!(conflict.ticket_id, ticket.id);
    assert_eq!(conflict.expected, TicketStatus::Backlog);

    // The row is untouched.
    let loaded = store.get_ticket(&ticket.id).expect("get").expect("exists");
    assert_eq!(loaded.status, TicketStatus::Ready);
}

#[test]
fn heal_restores_blocked_to_ready_with_fresh_budget() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 1);
    let run = store.create_run(&project, Some(&ticket.id), RunType::Worker, 1).expect("run");
    store
        .lease_ticket(&ticket.id, "agent-1", &run.id, Duration::seconds(60))
        .expect("lease");
    store
        .transition_ticket(&ticket.id, TicketStatus::Leased, TicketStatus::InProgress)
        .expect("start");
    assert_eq!(store.record_retryable_failure(&ticket.id).expect("fail"), TicketStatus::Blocked);

    store.heal_ticket(&ticket.id).expect("heal");
    let loaded = store.get_ticket(&ticket.id).expect("get").expect("exists");
    assert_eq!(loaded.status, TicketStatus::Ready);
    assert_eq!(loaded.retry_count, 0);
}

// ── Leasing ──────────────────────────────────────────────────────────────

#[test]
fn lease_next_ready_picks_highest_priority_and_flips_status() {
    let (store, project) = setup();
    let low = make_ticket(&store, &project, TicketStatus::Ready, 2);
    let mut high = make_ticket(&store, &project, TicketStatus::Backlog, 2);
    high.priority = 99;
    high.id = format!("{}-hi", high.id);
    store.insert_ticket(&high).expect("insert high");
    store
        .transition_ticket(&high.id, TicketStatus::Backlog, TicketStatus::Ready)
        .expect("approve high");

    let run = store.create_run(&project, None, RunType::Worker, 1).expect("run");
    let (leased, lease) = store
        .lease_next_ready(&project, "agent-1", &run.id, Duration::seconds(60))
        .expect("lease")
        .expect("a ready ticket exists");
    assert_eq!(leased.id, high.id, "priority 99 beats priority 10");
    assert_ne!(leased.id, low.id);
    assert_eq!(leased.status, TicketStatus::Leased);
    assert_eq!(lease.status, LeaseStatus::Issued);

    assert_eq!(store.issued_lease_count(&leased.id).expect("count"), 1);
}

#[test]
fn a_ticket_never_carries_two_issued_leases() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 2);
    let run = store.create_run(&project, Some(&ticket.id), RunType::Worker, 1).expect("run");

    store
        .lease_ticket(&ticket.id, "agent-1", &run.id, Duration::seconds(60))
        .expect("first lease");
    // Second lease attempt fails: the ticket is no longer ready.
    let err = store
        .lease_ticket(&ticket.id, "agent-2", &run.id, Duration::seconds(60))
        .expect_err("second lease must fail");
    assert!(err.downcast_ref::<StoreConflict>().is_some());
    assert_eq!(store.issued_lease_count(&ticket.id).expect("count"), 1);
}

#[test]
fn expired_lease_reclaims_to_ready_in_one_step() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 2);
    let run = store.create_run(&project, Some(&ticket.id), RunType::Worker, 1).expect("run");

    // A lease already past its expiry.
    let lease = store
        .lease_ticket(&ticket.id, "agent-1", &run.id, Duration::seconds(-1))
        .expect("lease");

    let reclaimed = store.reclaim_expired().expect("reclaim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].0, lease.id);
    assert_eq!(reclaimed[0].1, ticket.id);

    let loaded = store.get_ticket(&ticket.id).expect("get").expect("exists");
    assert_eq!(loaded.status, TicketStatus::Ready);
    let lease_row = store.get_lease(&lease.id).expect("get lease").expect("exists");
    assert_eq!(lease_row.status, LeaseStatus::Expired);
    // Reclaim never consumes a retry.
    assert_eq!(loaded.retry_count, 0);
}

#[test]
fn heartbeat_extends_an_issued_lease() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 2);
    let run = store.create_run(&project, Some(&ticket.id), RunType::Worker, 1).expect("run");
    let lease = store
        .lease_ticket(&ticket.id, "agent-1", &run.id, Duration::seconds(5))
        .expect("lease");

    store.heartbeat_lease(&lease.id, Duration::seconds(600)).expect("heartbeat");
    let refreshed = store.get_lease(&lease.id).expect("get").expect("exists");
    assert!(refreshed.expires_at > lease.expires_at);

    let reclaimed = store.reclaim_expired().expect("reclaim");
    assert!(reclaimed.is_empty(), "a heartbeat-fresh lease is not reclaimable");
}

// ── Retry ladder ─────────────────────────────────────────────────────────

#[test]
fn two_retries_then_blocked() {
    let (store, project) = setup();
    let ticket = make_ticket(&store, &project, TicketStatus::Ready, 2);

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let run = store.create_run(&project, Some(&ticket.id), RunType::Worker, 1).expect("run");
        let lease = store
            .lease_ticket(&ticket.id, "agent-1", &run.id, Duration::seconds(60))
            .expect("lease");
        store
            .transition_ticket(&ticket.id, TicketStatus::Leased, TicketStatus::InProgress)
            .expect("start");
        statuses.push(store.record_retryable_failure(&ticket.id).expect("fail"));
        store.release_lease(&lease.id).expect("release");
    }

    assert_eq!(statuses, vec![TicketStatus::Ready, TicketStatus::Blocked]);
    let loaded = store.get_ticket(&ticket.id).expect("get").expect("exists");
    assert_eq!(loaded.status, TicketStatus::Blocked);
    assert_eq!(loaded.retry_count, 2);
    assert!(loaded.retry_count <= loaded.max_retries);
}

// ── Runs ─────────────────────────────────────────────────────────────────

#[test]
fn run_starts_once_and_terminates_once() {
    let (store, project) = setup();
    let run = store.create_run(&project, None, RunType::Scout, 1).expect("run");
    assert_eq!(run.status, RunStatus::Pending);

    store.start_run(&run.id).expect("start");
    assert!(store.start_run(&run.id).is_err(), "second start must fail");

    store
        .complete_run(&run.id, RunStatus::Success, None, None)
        .expect("complete");
    assert!(
        store.complete_run(&run.id, RunStatus::Failure, Some("late"), None).is_err(),
        "second terminal transition must fail"
    );

    let loaded = store.get_run(&run.id).expect("get").expect("exists");
    assert_eq!(loaded.status, RunStatus::Success);
    assert!(loaded.started_at.is_some());
    assert!(loaded.completed_at.is_some());
}

#[test]
fn run_steps_get_gap_free_ordinals_and_unique_names() {
    let (store, project) = setup();
    let run = store.create_run(&project, None, RunType::Worker, 1).expect("run");

    let s1 = store
        .insert_run_step(&run.id, 1, "plan", StepKind::Internal, None, None, None)
        .expect("step 1");
    let s2 = store
        .insert_run_step(&run.id, 1, "execute", StepKind::Internal, None, None, None)
        .expect("step 2");
    let s3 = store
        .insert_run_step(&run.id, 1, "verify:0", StepKind::Command, Some("true"), None, None)
        .expect("step 3");
    assert!(s1 < s2 && s2 < s3);

    // Same name within the same attempt violates uniqueness.
    assert!(store
        .insert_run_step(&run.id, 1, "plan", StepKind::Internal, None, None, None)
        .is_err());
    // A new attempt starts its ordinals over.
    store
        .insert_run_step(&run.id, 2, "plan", StepKind::Internal, None, None, None)
        .expect("attempt 2 plan");

    let steps = store.list_run_steps(&run.id, 1).expect("list");
    let ordinals: Vec<i64> = steps.iter().map(|s| s.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3]);

    let attempt2 = store.list_run_steps(&run.id, 2).expect("list");
    assert_eq!(attempt2[0].ordinal, 1);
}

#[test]
fn finishing_a_step_records_tails_and_truncation() {
    let (store, project) = setup();
    let run = store.create_run(&project, None, RunType::Worker, 1).expect("run");
    let step = store
        .insert_run_step(&run.id, 1, "verify:0", StepKind::Command, Some("cargo test"), None, None)
        .expect("step");
    store.start_run_step(step).expect("start");
    store
        .finish_run_step(step, StepStatus::Failed, Some(101), Some("tail"), Some("boom"), 9_000, 4, None)
        .expect("finish");

    let steps = store.list_run_steps(&run.id, 1).expect("list");
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[0].exit_code, Some(101));
    assert!(steps[0].stdout_truncated, "9000 bytes against a 4-byte tail");
    assert!(!steps[0].stderr_truncated);
}

#[test]
fn cancel_open_steps_marks_running_work_canceled() {
    let (store, project) = setup();
    let run = store.create_run(&project, None, RunType::Worker, 1).expect("run");
    let step = store
        .insert_run_step(&run.id, 1, "execute", StepKind::Internal, None, None, None)
        .expect("step");
    store.start_run_step(step).expect("start");

    let changed = store.cancel_open_run_steps(&run.id).expect("cancel");
    assert_eq!(changed, 1);
    let steps = store.list_run_steps(&run.id, 1).expect("list");
    assert_eq!(steps[0].status, StepStatus::Canceled);
}

// ── Events ───────────────────────────────────────────────────────────────

#[test]
fn run_events_keep_insertion_order() {
    let (store, project) = setup();
    let run = store.create_run(&project, None, RunType::Scout, 1).expect("run");

    use promptwheel_core::types::RunEventType;
    store
        .append_run_event(&run.id, RunEventType::ProposalsFiltered, &serde_json::json!({"n": 3}))
        .expect("event");
    store
        .append_run_event(&run.id, RunEventType::TicketsCreated, &serde_json::json!({"n": 2}))
        .expect("event");

    let events = store.list_run_events(&run.id).expect("list");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, RunEventType::ProposalsFiltered);
    assert_eq!(events[1].event_type, RunEventType::TicketsCreated);
    assert!(events[0].created_at <= events[1].created_at);
    let tickets_created = events
        .iter()
        .filter(|e| e.event_type == RunEventType::TicketsCreated)
        .count();
    assert!(tickets_created <= 1, "TICKETS_CREATED appears at most once per scout");
}
