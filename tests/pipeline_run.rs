//! Pipeline Run Integration Tests
//!
//! Drives the controller end to end against in-memory adapters.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use deltaship::core::orchestrator::{self, ControllerState, RunError, RunOutcome};
use deltaship::core::{Orchestrator, RunRequest};
use deltaship::domain::{OutcomeStatus, RunState, Stage, StageStatus};
use tempfile::TempDir;

use common::{config, pipeline, Fakes, Script};

fn request(previous: &str, current: &str) -> RunRequest {
    RunRequest {
        previous: Some(previous.to_string()),
        current: Some(current.to_string()),
    }
}

fn orchestrator(home: &TempDir, fakes: &Fakes) -> Orchestrator {
    Orchestrator::new(pipeline(), config(home.path()), fakes.adapters()).unwrap()
}

#[tokio::test]
async fn test_only_changed_service_is_processed() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script::changed(&["svc-b/handler.py", "README.md"]));

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);

    let table = report.table().expect("run should produce a table");
    assert_eq!(table.len(), 1);
    assert_eq!(table.rows[0].service, "svc-b");
    assert_eq!(table.rows[0].label(), "Healthy");

    for stage in ["install", "test", "package", "push", "deploy", "verify"] {
        assert!(
            fakes.calls.has(&format!("{}:svc-b", stage)),
            "missing {} call",
            stage
        );
    }
    assert!(fakes.calls.for_service("svc-a").is_empty());
    assert!(fakes.calls.for_service("svc-c").is_empty());

    assert!(report.states.ends_with(&[
        ControllerState::Done,
        ControllerState::Cleanup,
        ControllerState::Success
    ]));
    assert_eq!(report.build_id.as_deref(), Some("rev1"));
    assert_eq!(fakes.cleanup_runs(), 1);
    assert_eq!(fakes.credentials.acquired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stage_order_within_a_branch() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script::changed(&["svc-a/app.py"]));

    orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let calls = fakes.calls.for_service("svc-a");
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();

    assert!(position("install:svc-a") < position("test:svc-a"));
    assert!(position("test:svc-a") < position("package:svc-a"));
    assert!(position("package:svc-a") < position("push:svc-a"));
    assert!(position("push:svc-a") < position("deploy:svc-a"));
    assert!(position("deploy:svc-a") < position("verify:svc-a"));
}

#[tokio::test]
async fn test_failing_branch_does_not_stop_siblings() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        failing_tests: vec!["svc-a".to_string()],
        ..Script::changed(&["svc-a/app.py", "svc-b/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.exit_code(), 1);

    let table = report.table().unwrap();
    assert_eq!(table.get("svc-a").unwrap().label(), "Failed@Test");
    assert_eq!(table.get("svc-b").unwrap().label(), "Healthy");

    // A failed branch never reaches packaging, let alone the platform
    assert!(!fakes.calls.has("package:svc-a"));
    assert!(!fakes.calls.has("deploy:svc-a"));
    assert!(fakes.calls.has("verify:svc-b"));
    assert_eq!(report.states.last(), Some(&ControllerState::Failure));
}

#[tokio::test]
async fn test_nothing_changed_is_a_successful_noop() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script::changed(&["docs/index.md", ".github/workflows/ci.yml"]));

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    assert!(report.is_noop());
    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert!(report.states.contains(&ControllerState::NoOpDone));
    assert!(!report.states.contains(&ControllerState::Building));

    assert!(fakes.stage_calls().is_empty());
    assert_eq!(fakes.credentials.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.cleanup_runs(), 1);
}

#[tokio::test]
async fn test_deploy_over_budget_times_out_that_branch() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        slow_deploys: vec!["svc-c".to_string()],
        deploy_delay: Duration::from_secs(3),
        ..Script::changed(&["svc-b/app.py", "svc-c/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let table = report.table().unwrap();
    let svc_c = table.get("svc-c").unwrap();
    assert_eq!(svc_c.status, OutcomeStatus::TimedOut);
    assert_eq!(svc_c.stage_reached, Stage::Deploy);
    assert_eq!(svc_c.label(), "TimedOut@Deploy");
    assert!(!fakes.calls.has("verify:svc-c"));

    assert_eq!(table.get("svc-b").unwrap().label(), "Healthy");
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_verify_over_budget_times_out_that_branch() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        stalled_rollouts: vec!["svc-a".to_string()],
        ..Script::changed(&["svc-a/app.py", "svc-b/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let table = report.table().unwrap();
    let svc_a = table.get("svc-a").unwrap();
    assert_eq!(svc_a.status, OutcomeStatus::TimedOut);
    assert_eq!(svc_a.label(), "TimedOut@Verify");

    assert_eq!(table.get("svc-b").unwrap().label(), "Healthy");
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_panicking_build_is_reported_at_its_stage() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        panicking_installs: vec!["svc-a".to_string()],
        ..Script::changed(&["svc-a/app.py", "svc-b/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let table = report.table().unwrap();
    let svc_a = table.get("svc-a").unwrap();
    assert_eq!(svc_a.label(), "Failed@Install");
    assert!(svc_a.detail.as_deref().unwrap().contains("panic"));
    assert_eq!(table.get("svc-b").unwrap().label(), "Healthy");

    assert!(!fakes.calls.has("test:svc-a"));
    assert_eq!(report.exit_code(), 1);

    let run = orchestrator::load_run(&config(home.path()).runs_dir(), report.run_id)
        .await
        .unwrap();
    assert_eq!(run.stage_status("svc-a", Stage::Install), Some(StageStatus::Failed));
    assert_eq!(run.stage_status("svc-a", Stage::Package), None);
}

#[tokio::test]
async fn test_unresolvable_revision_aborts_instead_of_noop() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        unresolvable: vec!["gone".to_string()],
        ..Script::changed(&["svc-a/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("gone", "rev1"))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted(RunError::Detection(_))
    ));
    assert!(!report.is_noop());
    assert_eq!(report.exit_code(), 1);
    assert!(fakes.stage_calls().is_empty());
    assert_eq!(fakes.cleanup_runs(), 1);
}

#[tokio::test]
async fn test_credential_failure_aborts_before_building() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        credentials_fail: true,
        ..Script::changed(&["svc-a/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    match &report.outcome {
        RunOutcome::Aborted(RunError::Infrastructure(reason)) => {
            assert!(reason.contains("registry"));
        }
        other => panic!("expected infrastructure abort, got {:?}", other),
    }
    assert!(!fakes.calls.has("install:svc-a"));
    assert_eq!(fakes.cleanup_runs(), 1);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_cleanup_failure_does_not_fail_the_run() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        cleanup_fails: true,
        ..Script::changed(&["svc-a/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(fakes.cleanup_runs(), 1);

    let run = orchestrator::load_run(&config(home.path()).runs_dir(), report.run_id)
        .await
        .unwrap();
    assert_eq!(run.cleanup_events, 1);
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn test_rollout_without_running_instances_fails_verification() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        no_instances: vec!["svc-a".to_string()],
        ..Script::changed(&["svc-a/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let row = report.table().unwrap().get("svc-a").unwrap().clone();
    assert_eq!(row.label(), "Failed@Verify");
    assert!(row.detail.unwrap().contains("no instances"));
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_run_is_reconstructed_from_its_log() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script {
        failing_tests: vec!["svc-b".to_string()],
        ..Script::changed(&["svc-a/app.py", "svc-b/app.py"])
    });

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let runs_dir = config(home.path()).runs_dir();
    let run = orchestrator::load_run(&runs_dir, report.run_id).await.unwrap();

    assert_eq!(run.pipeline_name, "services");
    assert_eq!(run.build_id.as_deref(), Some("rev1"));
    assert_eq!(run.changed_services, vec!["svc-a", "svc-b"]);
    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.stage_status("svc-a", Stage::Verify), Some(StageStatus::Completed));
    assert_eq!(run.stage_status("svc-b", Stage::Test), Some(StageStatus::Failed));
    assert_eq!(run.stage_status("svc-b", Stage::Package), None);

    let listed = orchestrator::list_runs(&runs_dir, 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, report.run_id);
}

#[tokio::test]
async fn test_next_run_starts_from_last_successful_revision() {
    let home = TempDir::new().unwrap();

    let first = Fakes::new(Script::changed(&["svc-a/app.py"]));
    let report = orchestrator(&home, &first)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();
    assert!(report.is_success());

    let second = Fakes::new(Script::changed(&["svc-c/app.py"]));
    let report = orchestrator(&home, &second)
        .run(RunRequest {
            previous: None,
            current: Some("rev2".to_string()),
        })
        .await
        .unwrap();

    let range = report.range.unwrap();
    assert_eq!(range.previous, "rev1");
    assert_eq!(range.current, "rev2");
    assert!(second.calls.has("diff:rev1..rev2"));
}

#[tokio::test]
async fn test_failed_run_is_not_a_baseline() {
    let home = TempDir::new().unwrap();

    let failing = Fakes::new(Script {
        failing_tests: vec!["svc-a".to_string()],
        ..Script::changed(&["svc-a/app.py"])
    });
    orchestrator(&home, &failing)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let next = Fakes::new(Script::changed(&["svc-a/app.py"]));
    let report = orchestrator(&home, &next)
        .run(RunRequest {
            previous: None,
            current: Some("rev2".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(report.range.unwrap().previous, "rev2~1");
}

#[tokio::test]
async fn test_outcome_report_is_stored_with_the_run() {
    let home = TempDir::new().unwrap();
    let fakes = Fakes::new(Script::changed(&["svc-a/app.py", "svc-c/app.py"]));

    let report = orchestrator(&home, &fakes)
        .run(request("rev0", "rev1"))
        .await
        .unwrap();

    let store = deltaship::core::EventStore::open(&config(home.path()).runs_dir(), report.run_id)
        .await
        .unwrap();
    let stored = store.load_report().await.unwrap().unwrap();

    assert_eq!(Some(&stored), report.table());
    let ids: Vec<&str> = stored.rows.iter().map(|r| r.service.as_str()).collect();
    assert_eq!(ids, vec!["svc-a", "svc-c"]);
}
