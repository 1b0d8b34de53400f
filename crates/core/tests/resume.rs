use kubestrap_core::events::{EventLog, EventType};
use kubestrap_core::storage::{FileStateStore, JsonlEventLog, StateStore};
use kubestrap_core::testing::{scripted_step, ScriptedAction, ScriptedCheck};
use kubestrap_core::workflow::StepGraph;
use kubestrap_core::{
    BootstrapConfig, ConfigError, ExecutionRecord, Orchestrator, RetryPolicy, Role, RunId,
    RunOptions, RunOutcome, RunResult, RunState, RunStatus, StepId, StepOutcome, StepStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    store: Arc<FileStateStore>,
    events: Arc<JsonlEventLog>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path().join("runs")).unwrap());
    let events = Arc::new(JsonlEventLog::new(dir.path().join("events")).unwrap());
    let orchestrator = Orchestrator::new(store.clone(), events.clone(), BootstrapConfig::default());
    Fixture {
        _dir: dir,
        store,
        events,
        orchestrator,
    }
}

async fn run(fixture: &Fixture, graph: &StepGraph) -> (RunResult, Vec<(String, StepOutcome)>) {
    let outcome = fixture
        .orchestrator
        .run_graph(
            Role::ControlPlane,
            graph,
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    match outcome {
        RunOutcome::Executed { result, steps, .. } => (
            result,
            steps
                .into_iter()
                .map(|s| (s.step_id.0, s.outcome))
                .collect(),
        ),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        Duration::from_millis(1),
        Duration::from_millis(5),
    )
}

#[tokio::test]
async fn failed_step_halts_run_and_is_retried_on_next_invocation() {
    let fixture = fixture();
    let a = ScriptedAction::succeeding();
    let b = ScriptedAction::failing_times(4, "kubeadm init: port 6443 in use");
    let c = ScriptedAction::succeeding();
    let graph = StepGraph::build(vec![
        scripted_step("a", a.clone()).build(),
        scripted_step("b", b.clone())
            .depends_on(["a"])
            .retry(quick_retry(3))
            .build(),
        scripted_step("c", c.clone()).depends_on(["a"]).build(),
    ])
    .unwrap();

    let (result, steps) = run(&fixture, &graph).await;
    assert_eq!(
        result,
        RunResult::Failed {
            step: StepId::new("b"),
            error: "kubeadm init: port 6443 in use".to_string(),
        }
    );
    assert_eq!(b.calls(), 4);
    assert_eq!(c.calls(), 0);
    assert_eq!(steps[2], ("c".to_string(), StepOutcome::NotAttempted));

    let run_id = RunId::new("control-plane");
    let stored = fixture.store.load(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    let b_record = stored.record(&StepId::new("b")).unwrap();
    assert_eq!(b_record.status, StepStatus::Failed);
    assert_eq!(b_record.attempts, 4);
    assert!(b_record.last_error.as_deref().is_some_and(|e| !e.is_empty()));
    assert_eq!(stored.status_of(&StepId::new("c")), Some(StepStatus::Pending));

    // The fifth call succeeds; a is not repeated
    let (result, steps) = run(&fixture, &graph).await;
    assert_eq!(result, RunResult::Succeeded);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 5);
    assert_eq!(c.calls(), 1);
    assert_eq!(steps[0], ("a".to_string(), StepOutcome::Resumed));

    let events = fixture.events.get_run_events(&run_id).await.unwrap();
    let retries = events
        .iter()
        .filter(|e| matches!(&e.event_type, EventType::StepFailed { will_retry: true, .. }))
        .count();
    assert_eq!(retries, 3);
    assert!(matches!(
        events.last().map(|e| &e.event_type),
        Some(EventType::RunFinished {
            status: RunStatus::Succeeded,
            ..
        })
    ));
}

#[tokio::test]
async fn killed_run_resumes_after_last_succeeded_step() {
    let fixture = fixture();
    let run_id = RunId::new("control-plane");

    // What a process killed while b was running leaves behind
    let mut state = RunState::new(run_id.clone(), Role::ControlPlane);
    let mut a = ExecutionRecord::pending(StepId::new("a"));
    a.status = StepStatus::Succeeded;
    a.attempts = 1;
    let mut b = ExecutionRecord::pending(StepId::new("b"));
    b.status = StepStatus::Running;
    b.attempts = 1;
    state.records = vec![a, b, ExecutionRecord::pending(StepId::new("c"))];
    state.status = RunStatus::Running;
    fixture.store.save(&run_id, &mut state).await.unwrap();
    std::fs::write(fixture.store.base_path().join("control-plane.lock"), "2147483646").unwrap();

    let actions: Vec<ScriptedAction> = (0..3).map(|_| ScriptedAction::succeeding()).collect();
    let graph = StepGraph::build(vec![
        scripted_step("a", actions[0].clone()).build(),
        scripted_step("b", actions[1].clone()).depends_on(["a"]).build(),
        scripted_step("c", actions[2].clone()).depends_on(["b"]).build(),
    ])
    .unwrap();

    let (result, steps) = run(&fixture, &graph).await;

    assert_eq!(result, RunResult::Succeeded);
    let calls: Vec<u32> = actions.iter().map(|a| a.calls()).collect();
    assert_eq!(calls, vec![0, 1, 1]);
    assert_eq!(steps[0].1, StepOutcome::Resumed);
    assert_eq!(steps[1].1, StepOutcome::Executed { attempts: 1 });

    let stored = fixture.store.load(&run_id).await.unwrap().unwrap();
    assert!(stored.all_succeeded());
    let holder =
        std::fs::read_to_string(fixture.store.base_path().join("control-plane.lock")).unwrap();
    assert!(holder.is_empty());
}

#[tokio::test]
async fn satisfied_preconditions_make_reruns_idempotent() {
    let fixture = fixture();
    let hosts = ScriptedAction::succeeding();
    let present = ScriptedCheck::sequence(&[false, true]);
    let graph = StepGraph::build(vec![scripted_step("configure-hosts", hosts.clone())
        .precondition(present.clone())
        .build()])
    .unwrap();

    let (first, _) = run(&fixture, &graph).await;
    assert_eq!(first, RunResult::Succeeded);
    assert_eq!(hosts.calls(), 1);

    // A fresh run of the same node: entries already present, action skipped
    fixture
        .orchestrator
        .reset(&RunId::new("control-plane"))
        .await
        .unwrap();
    let (second, steps) = run(&fixture, &graph).await;
    assert_eq!(second, RunResult::Succeeded);
    assert_eq!(hosts.calls(), 1);
    assert_eq!(steps[0].1, StepOutcome::AlreadySatisfied);
}

#[tokio::test]
async fn cyclic_graph_is_rejected_before_anything_runs() {
    let action = ScriptedAction::succeeding();
    let err = StepGraph::build(vec![
        scripted_step("step1", action.clone()).depends_on(["step3"]).build(),
        scripted_step("step2", action.clone()).depends_on(["step1"]).build(),
        scripted_step("step3", action.clone()).depends_on(["step2"]).build(),
    ])
    .err()
    .unwrap();

    match err {
        ConfigError::Cycle { steps } => {
            let ids: Vec<&str> = steps.iter().map(|s| s.as_str()).collect();
            assert_eq!(ids, vec!["step1", "step2", "step3", "step1"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(action.calls(), 0);
}

#[tokio::test]
async fn state_file_is_readable_json() {
    let fixture = fixture();
    let graph = StepGraph::build(vec![
        scripted_step("disable-swap", ScriptedAction::succeeding()).build(),
    ])
    .unwrap();
    run(&fixture, &graph).await;

    let path = fixture.store.state_path(&RunId::new("control-plane"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["role"], "control-plane");
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["records"][0]["step_id"], "disable-swap");
    assert_eq!(json["records"][0]["satisfied_by"], "action");
}
