//! Integration tests for bounded parallel execution.

mod common;

use common::{coordinator, stage, workflow, MockExecutor};
use stageflow::workflow::{RunOptions, RunStatus, StageStatus};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_parallel_chunks_respect_limit() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
    let (coordinator, _store) = coordinator(executor.clone());

    let names: Vec<String> = (0..7).map(|i| format!("p{}", i)).collect();
    let mut config = workflow("chunks")
        .with_max_parallel_stages(3)
        .stage(stage("plan").orchestrate(names.clone()));
    for name in &names {
        config = config.stage(stage(name).parallel());
    }

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.peak_concurrency(), 3);

    // Chunks are [p0..p2], [p3..p5], [p6]; a chunk starts only after the previous one finished.
    let invocations = executor.invocations();
    let find = |name: &str| invocations.iter().find(|inv| inv.stage == name).unwrap();
    let chunks: Vec<Vec<&str>> = vec![
        vec!["p0", "p1", "p2"],
        vec!["p3", "p4", "p5"],
        vec!["p6"],
    ];
    for pair in chunks.windows(2) {
        let previous_end = pair[0]
            .iter()
            .map(|name| find(*name).finished.unwrap())
            .max()
            .unwrap();
        for name in &pair[1] {
            assert!(find(*name).started >= previous_end, "{} started before its chunk", name);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_nested_fan_out_shares_the_limit() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(30)));
    let (coordinator, _store) = coordinator(executor.clone());

    let config = workflow("nested")
        .with_max_parallel_stages(2)
        .stage(stage("root").orchestrate(["left", "right"]))
        .stage(stage("left").parallel().orchestrate(["l1", "l2"]))
        .stage(stage("right").parallel().orchestrate(["r1", "r2"]))
        .stage(stage("l1").parallel())
        .stage(stage("l2").parallel())
        .stage(stage("r1").parallel())
        .stage(stage("r2").parallel());

    let result = coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed));
    assert!(executor.peak_concurrency() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_stages_never_overlap() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    let (coordinator, _store) = coordinator(executor.clone());

    let config = workflow("sequential")
        .stage(stage("plan").orchestrate(["a", "b", "c"]))
        .stage(stage("a"))
        .stage(stage("b"))
        .stage(stage("c"));

    coordinator.run(&config, RunOptions::new()).await.unwrap();

    assert_eq!(executor.peak_concurrency(), 1);
    assert_eq!(executor.call_order(), vec!["plan", "a", "b", "c"]);
}
