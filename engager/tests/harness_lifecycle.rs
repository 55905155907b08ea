//! Loop-level harness tests for full engagement lifecycle scenarios.
//!
//! These tests drive a `RunController` end to end against scripted adapters:
//! session traversal, retry bookkeeping, pause/resume, broadcasts, and
//! restoring an interrupted run from disk.

use std::sync::Arc;

use engager::core::types::{Relation, RunState, StepStatus};
use engager::error::ControlError;
use engager::io::broadcast::Snapshot;
use engager::io::generator::{Generation, GenerationError};
use engager::looping::LoopStop;
use engager::test_support::{
    Harness, ScriptedActuator, ScriptedGenerator, done_item, item, session_with, temp_root,
};
use tokio::sync::Semaphore;

/// Full lifecycle: a related item with one transient classify failure and an
/// unrelated item whose response generation fails until exhausted.
///
/// Execution sequence (max_attempts = 2):
/// 1. a: classify fails → unrelated, attempt recorded (relation is now known)
/// 2. a: primary, response
/// 3. b: classify related, primary
/// 4. b: response generation fails twice → `failed`
/// 5. b: secondary sends through the transient surface
/// 6. queue exhausted → idle
#[tokio::test]
async fn full_lifecycle_completes_session_with_retries() {
    let harness = Harness::new()
        .with_max_attempts(2)
        .with_actuator(
            ScriptedActuator::new()
                .with_relation("b", Relation::Related)
                .fail("classify", "a", 1),
        )
        .with_generator(ScriptedGenerator::new(vec![
            Ok(Generation::Text("reply a".to_string())),
            Err(GenerationError::Transport("connection reset".to_string())),
            Err(GenerationError::Transport("connection reset".to_string())),
            Ok(Generation::Text("hello b".to_string())),
        ]));
    harness.seed(session_with(vec![item("a"), item("b")]));
    let controller = harness.controller();

    controller.start("session-1").expect("start");
    let stop = controller.join().await;

    assert!(matches!(stop, Some(LoopStop::Complete { .. })));
    let session = harness.session("session-1");
    assert_eq!(session.run_state, RunState::Idle);

    let a = &session.items[0];
    assert_eq!(a.origin_relation, Relation::Unrelated);
    assert_eq!(a.attempts.classify, 1);
    assert_eq!(a.primary_status, StepStatus::Done);
    assert_eq!(a.generated_response.as_deref(), Some("reply a"));

    let b = &session.items[1];
    assert_eq!(b.origin_relation, Relation::Related);
    assert_eq!(b.response_status, StepStatus::Failed);
    assert_eq!(b.attempts.response, 2);
    assert!(b.generated_response.is_none());
    assert_eq!(b.secondary_status, StepStatus::Done);
    assert_eq!(b.generated_secondary_message.as_deref(), Some("hello b"));
    assert_eq!(harness.actuator.open_surfaces(), 0);

    // Final broadcast carries the whole picture.
    let last = harness.recorder.snapshots().pop().expect("snapshots");
    assert_eq!(last.run_state, Some(RunState::Idle));
    assert_eq!(last.session_id.as_deref(), Some("session-1"));
    assert_eq!(last.items.as_ref().map(Vec::len), Some(2));
}

/// Observers that merge every snapshot end with the persisted record.
#[tokio::test]
async fn merged_broadcasts_match_persisted_state() {
    let harness = Harness::new().with_actuator(
        ScriptedActuator::new().with_relation("a", Relation::Related),
    );
    harness.seed(session_with(vec![item("a"), item("b")]));
    let controller = harness.controller();

    controller.start("session-1").expect("start");
    controller.join().await;

    let snapshots = harness.recorder.snapshots();
    assert_eq!(snapshots[0].run_state, Some(RunState::Running));
    let mut view = Snapshot::default();
    for snapshot in snapshots {
        view.merge(snapshot);
    }
    let session = harness.session("session-1");
    assert_eq!(view.run_state, Some(session.run_state));
    assert_eq!(view.items, Some(session.items));
}

/// A step in flight when `stop` lands is committed, and nothing else runs
/// until `resume`.
#[tokio::test]
async fn pause_lets_in_flight_step_finish() {
    let gate = Arc::new(Semaphore::new(0));
    let mut first = item("a");
    first.origin_relation = Relation::Unrelated;
    let harness = Harness::new()
        .with_actuator(ScriptedActuator::new().with_primary_gate(Arc::clone(&gate)));
    harness.seed(session_with(vec![first]));
    let controller = harness.controller();

    controller.start("session-1").expect("start");
    while harness.actuator.calls().iter().all(|c| c != "primary:a") {
        tokio::task::yield_now().await;
    }
    controller.stop().expect("stop");
    assert_eq!(controller.stop(), Err(ControlError::NotRunning));
    gate.add_permits(1);
    controller.join().await;

    let session = harness.session("session-1");
    assert_eq!(session.run_state, RunState::Paused);
    assert_eq!(session.items[0].primary_status, StepStatus::Done);
    assert_eq!(session.items[0].response_status, StepStatus::Pending);
    assert!(
        harness
            .actuator
            .calls()
            .iter()
            .all(|c| !c.starts_with("respond:"))
    );
}

/// A paused run survives a restart: the next process restores the session
/// as paused and `resume` continues with the next pending step.
#[tokio::test]
async fn restart_restores_paused_session_and_resumes() {
    let temp = temp_root();
    let gate = Arc::new(Semaphore::new(0));
    {
        let mut first = item("a");
        first.origin_relation = Relation::Unrelated;
        let harness = Harness::at(temp.path())
            .with_actuator(ScriptedActuator::new().with_primary_gate(Arc::clone(&gate)));
        harness.seed(session_with(vec![first, item("b")]));
        let controller = harness.controller();

        controller.start("session-1").expect("start");
        while harness.actuator.calls().iter().all(|c| c != "primary:a") {
            tokio::task::yield_now().await;
        }
        controller.stop().expect("stop");
        gate.add_permits(1);
        controller.join().await;
    }

    let harness = Harness::at(temp.path());
    let controller = harness.controller();
    assert_eq!(controller.status().run_state, RunState::Idle);
    assert_eq!(
        controller.restore().expect("restore").as_deref(),
        Some("session-1")
    );
    let status = controller.status();
    assert_eq!(status.run_state, RunState::Paused);
    assert_eq!(status.active_session_id.as_deref(), Some("session-1"));

    controller.resume().expect("resume");
    let stop = controller.join().await;

    assert!(matches!(stop, Some(LoopStop::Complete { .. })));
    let calls = harness.actuator.calls();
    assert_eq!(calls.first().map(String::as_str), Some("respond:a:Thanks for sharing!"));
    assert!(calls.iter().all(|c| c != "primary:a"));
    assert!(calls.contains(&"primary:b".to_string()));
    let session = harness.session("session-1");
    assert_eq!(session.run_state, RunState::Idle);
    assert!(session.items.iter().all(|it| it.response_status == StepStatus::Done));
}

/// An already-finished session starts and immediately returns to idle
/// without touching the surface.
#[tokio::test]
async fn finished_session_runs_to_idle_without_actions() {
    let harness = Harness::new();
    harness.seed(session_with(vec![done_item("a", Relation::Related)]));
    let controller = harness.controller();

    controller.start("session-1").expect("start");
    assert_eq!(controller.start("session-1"), Err(ControlError::AlreadyRunning));
    let stop = controller.join().await;

    assert!(matches!(stop, Some(LoopStop::Complete { .. })));
    assert!(harness.actuator.calls().is_empty());
    assert_eq!(controller.status().run_state, RunState::Idle);
    assert_eq!(harness.session("session-1").items, vec![done_item("a", Relation::Related)]);
}

/// Items enqueued while the loop runs are picked up in stored order.
#[tokio::test]
async fn items_added_mid_run_are_processed() {
    let gate = Arc::new(Semaphore::new(0));
    let mut first = item("a");
    first.origin_relation = Relation::Unrelated;
    let harness = Harness::new()
        .with_actuator(ScriptedActuator::new().with_primary_gate(Arc::clone(&gate)));
    harness.seed(session_with(vec![first]));
    let controller = harness.controller();

    controller.start("session-1").expect("start");
    while harness.actuator.calls().iter().all(|c| c != "primary:a") {
        tokio::task::yield_now().await;
    }
    let added = controller
        .add_items("session-1", vec![item("a"), item("b")], Default::default())
        .expect("add items");
    assert_eq!(added, 1);
    gate.add_permits(10);
    controller.join().await;

    let session = harness.session("session-1");
    let ids: Vec<&str> = session.items.iter().map(|it| it.item_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(session.items.iter().all(|it| it.response_status == StepStatus::Done));
}
