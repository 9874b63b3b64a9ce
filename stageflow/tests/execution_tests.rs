//! Integration tests for workflow execution.

mod common;

use common::{coordinator, stage, workflow, Behavior, MockExecutor};
use serde_json::json;
use stageflow::error::{ConfigError, EngineError};
use stageflow::events::EventType;
use stageflow::workflow::{AgentConfig, RunOptions, RunStatus, StageStatus, WorkflowStage};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_two_stage_fixed_workflow_completes() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("linear")
        .stage(stage("a").on_success("b"))
        .stage(stage("b"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let statuses: Vec<(&str, StageStatus)> = result
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![("a", StageStatus::Completed), ("b", StageStatus::Completed)]
    );
    assert_eq!(executor.call_order(), vec!["a", "b"]);
    assert_eq!(result.context["a_result"], json!("a done"));
    assert_eq!(result.context["a_success"], json!(true));
    assert_eq!(result.context["b_success"], json!(true));
    assert!(result.first_failure().is_none());
}

#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let executor = Arc::new(MockExecutor::instant().with("flaky", Behavior::Fail("nope".into())));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("retry").stage(stage("flaky").retries(2));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(executor.calls("flaky"), 3);
    assert_eq!(result.status, RunStatus::Failed);
    let flaky = result.stage("flaky").unwrap();
    assert_eq!(flaky.status, StageStatus::Failed);
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(flaky.error.as_deref(), Some("nope"));
    assert_eq!(result.context["flaky_error"], json!("nope"));
    assert_eq!(result.context["flaky_success"], json!(false));

    let attempts: Vec<u32> = executor.invocations().iter().map(|inv| inv.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_retry_then_success_reuses_instruction() {
    let executor = Arc::new(MockExecutor::instant().with("flaky", Behavior::FailTimes(1)));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("retry")
        .stage(stage("flaky").retries(3).on_success("after"))
        .stage(stage("after"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.calls("flaky"), 2);
    assert_eq!(executor.calls("after"), 1);
    assert_eq!(result.stage("flaky").unwrap().retry_count, 1);
    assert!(result.stage("flaky").unwrap().error.is_none());

    let invocations = executor.invocations();
    assert_eq!(invocations[0].instruction, invocations[1].instruction);
}

#[tokio::test(start_paused = true)]
async fn test_orchestrate_fans_out_concurrently() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(100)));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("fanout")
        .stage(stage("plan").orchestrate(["x", "y"]))
        .stage(stage("x").parallel())
        .stage(stage("y").parallel());

    let mut events = coordinator.subscribe();
    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.peak_concurrency(), 2);

    let invocations = executor.invocations();
    let x = invocations.iter().find(|inv| inv.stage == "x").unwrap();
    let y = invocations.iter().find(|inv| inv.stage == "y").unwrap();
    assert_eq!(x.started, y.started);

    let mut decisions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::OrchestratorDecision {
            decisions.push(event.data);
        }
    }
    assert_eq!(decisions, vec![json!({"stage": "plan", "nextSteps": ["x", "y"]})]);
}

#[tokio::test]
async fn test_failure_transition_is_followed() {
    let executor = Arc::new(MockExecutor::instant().with("build", Behavior::Fail("compile error".into())));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("recover")
        .stage(stage("build").on_success("ship").on_failure("fix"))
        .stage(stage("ship"))
        .stage(stage("fix"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(executor.call_order(), vec!["build", "fix"]);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.stage("fix").unwrap().status, StageStatus::Completed);
    assert_eq!(result.stage("ship").unwrap().status, StageStatus::Skipped);

    let failure = result.first_failure().unwrap();
    assert_eq!(failure.name, "build");
    assert_eq!(failure.error.as_deref(), Some("compile error"));
}

#[tokio::test]
async fn test_orchestrate_failure_ends_branch() {
    let executor = Arc::new(MockExecutor::instant().with("plan", Behavior::Fail("no plan".into())));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("fanout")
        .stage(stage("plan").orchestrate(["x"]).on_failure("x"))
        .stage(stage("x"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(executor.call_order(), vec!["plan"]);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.stage("x").unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_end_sentinel_terminates_branch() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("end")
        .stage(stage("a").on_success("end"))
        .stage(stage("b").orchestrate(["end"]));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.call_order(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_multiple_entry_stages_all_run() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("entries")
        .stage(stage("lint"))
        .stage(stage("test").parallel())
        .stage(stage("docs"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    // Parallel stages of a batch run before its sequential ones.
    assert_eq!(executor.call_order(), vec!["test", "lint", "docs"]);
}

#[tokio::test]
async fn test_unknown_agent_fails_before_state_exists() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, store) = coordinator(executor.clone());
    let config = workflow("broken").stage(WorkflowStage::new("a", "ghost"));

    let err = coordinator.run(&config, RunOptions::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Config(ConfigError::UnknownAgent { .. })));
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(executor.calls("a"), 0);
}

#[tokio::test]
async fn test_unresolvable_mode_fails_before_state_exists() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, store) = coordinator(executor);
    let config = workflow("broken")
        .agent(AgentConfig::new("oracle", "prophecy"))
        .stage(WorkflowStage::new("a", "oracle"));

    let err = coordinator.run(&config, RunOptions::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Config(ConfigError::UnresolvedMode { .. })));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_opt_in_cycle_detection() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor);
    let config = workflow("loop")
        .stage(stage("start").on_success("a"))
        .stage(stage("a").on_success("b"))
        .stage(stage("b").on_success("a"));

    let err = coordinator
        .run(&config, RunOptions::new().with_cycle_detection(true))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(ConfigError::CycleDetected(_))));
}

#[tokio::test]
async fn test_definition_without_entry_stage_is_rejected() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, store) = coordinator(executor.clone());
    let config = workflow("closed-loop")
        .stage(stage("a").on_success("b"))
        .stage(stage("b").on_success("a"));

    let err = coordinator
        .run(&config, RunOptions::new().with_cycle_detection(false))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Config(ConfigError::NoEntryStage(name)) if name == "closed-loop"));
    assert!(executor.call_order().is_empty());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_context_and_correlation_reach_the_agent() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("ctx")
        .stage(stage("plan").on_success("build"))
        .stage(stage("build").describe("Build what the plan says."));

    let options = RunOptions::new()
        .with_run_id("run-ctx")
        .with_parent_task_id("task-42")
        .with_context_value("ticket", json!("ABC-1"));
    let result = coordinator.run(&config, options).await.unwrap();

    assert_eq!(result.run_id, "run-ctx");
    assert_eq!(result.context["ticket"], json!("ABC-1"));

    let build = executor
        .invocations()
        .into_iter()
        .find(|inv| inv.stage == "build")
        .unwrap();
    assert_eq!(build.correlation_id, "task-42");
    assert!(build.instruction.contains("Build what the plan says."));
    assert!(build.instruction.contains("- ticket: ABC-1"));
    assert!(build.instruction.contains("- plan_result: plan done"));
}

#[tokio::test]
async fn test_event_stream_for_successful_run() {
    let executor = Arc::new(MockExecutor::instant());
    let (coordinator, _store) = coordinator(executor);
    let config = workflow("events").stage(stage("only"));

    let mut rx = coordinator.subscribe();
    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.run_id, result.run_id);
        events.push(event.event_type);
    }
    assert_eq!(
        events,
        vec![
            EventType::WorkflowStarted,
            EventType::StageStarted,
            EventType::StageCompleted,
            EventType::WorkflowCompleted,
        ]
    );
}

#[tokio::test]
async fn test_stop_aborts_in_flight_stage() {
    let executor = Arc::new(MockExecutor::instant().with("c", Behavior::Hang));
    let (coordinator, store) = coordinator(executor.clone());
    let coordinator = Arc::new(coordinator);
    let config = workflow("stoppable")
        .stage(stage("c").on_success("d"))
        .stage(stage("d"));

    let runner = {
        let coordinator = coordinator.clone();
        let config = config.clone();
        tokio::spawn(async move {
            coordinator
                .run(&config, RunOptions::new().with_run_id("run-stop"))
                .await
        })
    };

    executor.wait_for_start("c").await;
    assert_eq!(coordinator.active_runs().await, vec!["run-stop".to_string()]);

    let aborted = coordinator.stop("run-stop").await.unwrap();
    assert_eq!(aborted, vec!["c".to_string()]);

    let result = runner.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(executor.aborted(), vec!["c".to_string()]);
    assert_eq!(executor.calls("d"), 0);
    assert_eq!(result.stage("c").unwrap().status, StageStatus::Failed);
    // Unscheduled stages are left untouched by a stop.
    assert_eq!(result.stage("d").unwrap().status, StageStatus::Pending);

    assert!(coordinator.active_runs().await.is_empty());
    assert_eq!(store.load("run-stop").await.unwrap().status, RunStatus::Failed);
    assert!(matches!(
        coordinator.stop("run-stop").await,
        Err(EngineError::RunNotActive(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_converging_branches_do_not_double_run() {
    let executor = Arc::new(
        MockExecutor::instant()
            .with("left", Behavior::Succeed { delay: Duration::from_millis(10) })
            .with("right", Behavior::Succeed { delay: Duration::from_millis(200) }),
    );
    let (coordinator, _store) = coordinator(executor.clone());
    let mut events = coordinator.subscribe();
    let config = workflow("diamond")
        .stage(stage("plan").orchestrate(["left", "right"]))
        .stage(stage("left").parallel().on_success("merge"))
        .stage(stage("right").parallel().on_success("merge"))
        .stage(stage("merge").describe("Merge both halves."));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.calls("merge"), 1);
    assert_eq!(result.stage("merge").unwrap().status, StageStatus::Completed);

    let mut merge_started = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EventType::StageStarted && event.data["stage"] == json!("merge") {
            merge_started += 1;
        }
    }
    assert_eq!(merge_started, 1);
}

#[tokio::test]
async fn test_loop_back_reruns_completed_stage() {
    let executor = Arc::new(MockExecutor::instant().with("check", Behavior::FailTimes(1)));
    let (coordinator, _store) = coordinator(executor.clone());
    let config = workflow("loop")
        .stage(stage("build").on_success("check"))
        .stage(stage("check").on_failure("build"));

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(executor.call_order(), vec!["build", "check", "build", "check"]);
    assert_eq!(result.stage("build").unwrap().status, StageStatus::Completed);
    assert_eq!(result.stage("check").unwrap().status, StageStatus::Completed);
    assert_eq!(result.status, RunStatus::Completed);
}
