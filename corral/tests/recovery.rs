//! Operator recovery over a temp root: timed-out claim recovery and the
//! two-direction claim reconciliation sweep.

use chrono::Utc;

use corral::core::session::SessionRecord;
use corral::core::task::{TaskEvent, TaskRecord, TaskStatus};
use corral::io::record;
use corral::tasks::ClaimOptions;
use corral::test_support as support;

#[test]
fn stale_heartbeat_claims_return_to_the_pool() {
    let store = support::store();
    let coordinator = store.coordinator();
    support::seed_session(&store.ctx, "s1");
    support::seed_task(&store.ctx, "t1");
    coordinator
        .claim_task("t1", "s1", ClaimOptions::default())
        .expect("claim");
    coordinator
        .transition_task("t1", TaskEvent::Start)
        .expect("start");

    // A live session keeps its claim.
    let reclaimed = coordinator.recover_timed_out_claims(None).expect("sweep");
    assert!(reclaimed.is_empty());
    assert_eq!(
        coordinator.get_task("t1").expect("task").owner.as_deref(),
        Some("s1")
    );

    // Backdate the heartbeat past the configured timeout.
    record::update_atomic(
        "session",
        "s1",
        &store.ctx.layout().session_path("s1"),
        store.ctx.lock_settings(),
        |session: &mut SessionRecord| {
            session.last_heartbeat = Utc::now() - chrono::Duration::hours(2);
            Ok(())
        },
    )
    .expect("backdate heartbeat");

    let reclaimed = coordinator.recover_timed_out_claims(None).expect("sweep");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].session_id, "s1");
    assert_eq!(reclaimed[0].task_id, "t1");

    // The task is back in the pool; the session no longer lists the claim.
    let task = coordinator.get_task("t1").expect("task");
    assert_eq!(task.owner, None);
    assert_eq!(task.status, TaskStatus::Todo);
    let session = coordinator.get_session("s1").expect("session");
    assert!(session.claims.is_empty());

    // A second sweep finds nothing left to recover.
    assert!(
        coordinator
            .recover_timed_out_claims(None)
            .expect("sweep")
            .is_empty()
    );
}

#[test]
fn repair_reconciles_both_claim_directions() {
    let store = support::store();
    let coordinator = store.coordinator();
    support::seed_session(&store.ctx, "s1");
    support::seed_task(&store.ctx, "t-orphaned");
    support::seed_task(&store.ctx, "t-dangling");

    // A consistent store repairs to nothing.
    assert!(coordinator.repair().expect("noop sweep").is_clean());

    // Crash window, task side: an owner the session never corroborated.
    record::update_atomic(
        "task",
        "t-orphaned",
        &store.ctx.layout().task_path("t-orphaned"),
        store.ctx.lock_settings(),
        |task: &mut TaskRecord| {
            task.owner = Some("s1".to_string());
            Ok(())
        },
    )
    .expect("seed orphaned owner");

    // Crash window, session side: a claim entry the task never recorded.
    record::update_atomic(
        "session",
        "s1",
        &store.ctx.layout().session_path("s1"),
        store.ctx.lock_settings(),
        |session: &mut SessionRecord| {
            session.claims.insert("t-dangling".to_string());
            Ok(())
        },
    )
    .expect("seed dangling claim");

    let report = coordinator.repair().expect("sweep");
    assert_eq!(report.cleared_task_owners, vec!["t-orphaned".to_string()]);
    assert_eq!(report.dropped_session_claims.len(), 1);
    assert_eq!(report.dropped_session_claims[0].session_id, "s1");
    assert_eq!(report.dropped_session_claims[0].task_id, "t-dangling");

    let task = coordinator.get_task("t-orphaned").expect("task");
    assert_eq!(task.owner, None);
    let session = coordinator.get_session("s1").expect("session");
    assert!(session.claims.is_empty());

    // The sweep converges: a repaired store is clean.
    assert!(coordinator.repair().expect("second sweep").is_clean());
}
