//! Batch execution through the parallel executor

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tool_orchestrator::{BatchOptions, OrchestratorError, ToolCall};

use crate::support::{backend, config, Harness};

fn call(backend: &str, tool: &str, params: serde_json::Value) -> ToolCall {
    ToolCall::new(backend, tool, params)
}

#[tokio::test(start_paused = true)]
async fn test_results_keep_input_order() {
    let harness = Harness::new(&["a", "b"]);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));
    orch.connect_all().await.unwrap();

    // c1 finishes last, c2 fails, c3 finishes first
    let results = orch
        .call_tools_parallel(vec![
            call("a", "c1", json!({"delay_ms": 300})),
            call("b", "c2", json!({"delay_ms": 100, "fail": true})),
            call("a", "c3", json!({"delay_ms": 10})),
        ])
        .await;

    assert_eq!(results.len(), 3);
    let tools: Vec<_> = results.iter().map(|r| r.call.tool.as_str()).collect();
    assert_eq!(tools, vec!["c1", "c2", "c3"]);
    assert!(results[0].is_success());
    assert!(!results[1].is_success());
    assert!(results[2].is_success());
    assert!(matches!(
        results[1].error(),
        Some(OrchestratorError::ToolExecution { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_contacts_nothing() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    let results = orch.call_tools_parallel(Vec::new()).await;

    assert!(results.is_empty());
    assert_eq!(harness.total_calls(), 0);
    assert_eq!(orch.stats().total_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let harness = Harness::new(&["a", "b"]);
    let mut cfg = config(vec![backend("a"), backend("b")]);
    cfg.max_concurrency = 3;
    let orch = harness.orchestrator(cfg);
    orch.connect_all().await.unwrap();

    let calls: Vec<_> = (0..10)
        .map(|i| {
            let name = if i % 2 == 0 { "a" } else { "b" };
            call(name, "work", json!({"delay_ms": 20 + i * 5}))
        })
        .collect();
    let results = orch.call_tools_parallel(calls).await;

    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(harness.total_calls(), 10);
    assert_eq!(harness.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batches_share_the_ceiling() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a")]);
    cfg.max_concurrency = 2;
    let orch = harness.orchestrator(cfg);
    orch.connect_all().await.unwrap();

    let batch = || {
        (0..4)
            .map(|_| call("a", "work", json!({"delay_ms": 50})))
            .collect::<Vec<_>>()
    };
    let (first, second) = tokio::join!(
        orch.call_tools_parallel(batch()),
        orch.call_tools_parallel(batch())
    );

    assert_eq!(first.len() + second.len(), 8);
    assert_eq!(harness.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_call_times_out_alone() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    let started = Instant::now();
    let results = orch
        .call_tools_parallel(vec![
            call("a", "fast", json!({"delay_ms": 10})),
            call("a", "slow", json!({"delay_ms": 60_000})).with_timeout(Duration::from_millis(100)),
            call("a", "medium", json!({"delay_ms": 50})),
        ])
        .await;

    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(results[0].is_success());
    assert!(matches!(results[1].error(), Some(OrchestratorError::Timeout { .. })));
    assert!(results[2].is_success());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_mode_runs_every_call() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("b").set(|b| b.connect_fails = true);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));
    orch.connect_all().await.unwrap();

    let results = orch
        .call_tools_parallel(vec![
            call("b", "down", json!({})),
            call("a", "up", json!({})),
            call("zzz", "missing", json!({})),
            call("a", "up_again", json!({})),
        ])
        .await;

    assert!(matches!(results[0].error(), Some(OrchestratorError::Connection { .. })));
    assert!(results[1].is_success());
    assert!(matches!(results[2].error(), Some(OrchestratorError::UnknownBackend { .. })));
    assert!(results[3].is_success());
    assert_eq!(harness.backend("a").calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_mode_cancels_queued_calls() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a")]);
    cfg.max_concurrency = 1;
    let orch = harness.orchestrator(cfg);
    orch.connect_all().await.unwrap();

    let results = orch
        .call_tools_parallel_with(
            vec![
                call("a", "first", json!({"fail": true})),
                call("a", "second", json!({})),
                call("a", "third", json!({})),
            ],
            BatchOptions::default().abort_on_failure(),
        )
        .await;

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0].error(), Some(OrchestratorError::ToolExecution { .. })));
    for result in &results[1..] {
        assert!(matches!(result.error(), Some(OrchestratorError::Cancelled { .. })));
    }
    assert_eq!(harness.backend("a").calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_mode_lets_started_calls_finish() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a")]);
    cfg.max_concurrency = 2;
    let orch = harness.orchestrator(cfg);
    orch.connect_all().await.unwrap();

    let results = orch
        .call_tools_parallel_with(
            vec![
                call("a", "fails_fast", json!({"delay_ms": 10, "fail": true})),
                call("a", "already_running", json!({"delay_ms": 200})),
                call("a", "queued", json!({})),
            ],
            BatchOptions::default().abort_on_failure(),
        )
        .await;

    assert!(!results[0].is_success());
    assert!(results[1].is_success());
    assert!(matches!(results[2].error(), Some(OrchestratorError::Cancelled { .. })));
    assert_eq!(harness.backend("a").calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_reports_each_completion() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let options = BatchOptions::default().with_progress(move |progress| {
        sink.lock().push((progress.completed, progress.total, progress.index));
    });

    orch.call_tools_parallel_with(
        vec![
            call("a", "slow", json!({"delay_ms": 30})),
            call("a", "fast", json!({"delay_ms": 10})),
        ],
        options,
    )
    .await;

    assert_eq!(*seen.lock(), vec![(1, 2, 1), (2, 2, 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_batch_releases_slots() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a")]);
    cfg.max_concurrency = 1;
    let orch = harness.orchestrator(cfg);
    orch.connect_all().await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        orch.call_tools_parallel(vec![call("a", "stuck", json!({"delay_ms": 60_000}))]),
    )
    .await;
    assert!(abandoned.is_err());

    let results = tokio::time::timeout(
        Duration::from_millis(500),
        orch.call_tools_parallel(vec![call("a", "next", json!({}))]),
    )
    .await
    .expect("slot was released");
    assert!(results[0].is_success());
}
