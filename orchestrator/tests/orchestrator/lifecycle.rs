//! Facade lifecycle: start/stop, scoped runs and statistics

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::json;
use tool_orchestrator::OrchestratorError;

use crate::support::{backend, config, Harness};

#[tokio::test(start_paused = true)]
async fn test_start_and_stop() {
    let harness = Harness::new(&["a", "b"]);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    let report = orch.start().await.unwrap();
    assert_eq!(report.connected.len(), 2);
    assert!(orch.is_running().await);

    orch.stop().await;
    assert!(!orch.is_running().await);
    assert!(!orch.is_connected("a"));
    assert!(!orch.is_connected("b"));
    assert_eq!(harness.backend("a").disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.start().await.unwrap();

    orch.stop().await;
    orch.stop().await;
    orch.stop().await;

    assert_eq!(harness.backend("a").disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_does_not_reconnect() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    orch.start().await.unwrap();
    let again = orch.start().await.unwrap();

    assert_eq!(again.already_connected, vec!["a".to_string()]);
    assert_eq!(harness.backend("a").connects(), 1);
    orch.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    orch.start().await.unwrap();
    orch.stop().await;
    orch.start().await.unwrap();

    assert!(orch.is_connected("a"));
    orch.call_tool("a", "a_status", json!({}), None).await.unwrap();
    orch.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_calls() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.start().await.unwrap();

    let call = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.call_tool("a", "a_run", json!({"delay_ms": 200}), None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(orch.stats().in_flight, 1);

    orch.stop().await;

    let result = call.await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(harness.backend("a").disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_calls_past_grace() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a").with_timeout(Duration::from_secs(60))]);
    cfg.shutdown_grace = Duration::from_millis(100);
    let orch = harness.orchestrator(cfg);
    orch.start().await.unwrap();

    let call = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.call_tool("a", "a_run", json!({"delay_ms": 30_000}), None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    orch.stop().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled { .. }));
    assert_eq!(orch.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_stops_after_normal_return() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let value = orch
        .run_scoped(|orch| async move {
            orch.call_tool("a", "a_status", json!({}), None)
                .await
                .map(|r| r.is_success())
        })
        .await
        .unwrap();

    assert!(value.unwrap());
    assert!(!orch.is_connected("a"));
    assert_eq!(harness.backend("a").disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_stops_after_error() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let inner = orch
        .run_scoped(|orch| async move { orch.call_tool("zzz", "t", json!({}), None).await })
        .await
        .unwrap();

    assert!(matches!(inner, Err(OrchestratorError::UnknownBackend { .. })));
    assert!(!orch.is_connected("a"));
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_stops_after_panic() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let outcome = AssertUnwindSafe(orch.run_scoped(|_orch| async move {
        panic!("caller bug");
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert!(!orch.is_connected("a"));
    assert_eq!(harness.backend("a").disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_stops_when_cancelled() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        orch.run_scoped(|_orch| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }),
    )
    .await;
    assert!(cancelled.is_err());

    // Shutdown was handed to the runtime
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!orch.is_connected("a"));
    assert!(!orch.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_reports_start_failure() {
    let harness = Harness::new(&["a"]);
    harness.backend("a").set(|b| b.connect_fails = true);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let err = orch.run_scoped(|_orch| async move {}).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoBackendsAvailable { .. }));
    assert!(!orch.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected() {
    let harness = Harness::new(&["a"]);
    let cfg = config(vec![backend("a"), backend("a")]);

    let err = tool_orchestrator::Orchestrator::new(cfg, harness.factory())
        .err()
        .unwrap();
    assert!(matches!(err, OrchestratorError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_stats_track_calls_and_failures() {
    let harness = Harness::new(&["a", "b"]);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));
    orch.start().await.unwrap();

    orch.call_tool("a", "a_status", json!({}), None).await.unwrap();
    orch.call_tool("a", "a_run", json!({"fail": true}), None)
        .await
        .unwrap_err();
    orch.call_tool("b", "b_run", json!({}), Some(Duration::from_millis(10)))
        .await
        .unwrap();

    let stats = orch.stats();
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.total_calls, 3);
    assert_eq!(stats.total_failures, 1);
    assert_eq!(stats.in_flight, 0);

    let a = stats.backends.iter().find(|m| m.backend == "a").unwrap();
    assert_eq!(a.success_count, 1);
    assert_eq!(a.error_count, 1);
    assert_eq!(a.last_error_kind, Some("tool_execution"));

    orch.stop().await;
    assert_eq!(orch.stats().active_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_calls_work_after_stop_cancelled_stragglers() {
    let harness = Harness::new(&["a"]);
    let mut cfg = config(vec![backend("a").with_timeout(Duration::from_secs(60))]);
    cfg.shutdown_grace = Duration::from_millis(100);
    let orch = harness.orchestrator(cfg);
    orch.start().await.unwrap();

    let straggler = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.call_tool("a", "a_run", json!({"delay_ms": 30_000}), None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    orch.stop().await;
    assert!(matches!(
        straggler.await.unwrap().unwrap_err(),
        OrchestratorError::Cancelled { .. }
    ));

    // Reconnecting without start() must not inherit the shutdown cancellation
    orch.connect_all().await.unwrap();
    assert!(orch.is_connected("a"));

    let result = orch.call_tool("a", "a_status", json!({}), None).await.unwrap();
    assert!(result.is_success());

    let batch = orch
        .call_tools_parallel(vec![tool_orchestrator::ToolCall::new("a", "a_status", json!({}))])
        .await;
    assert!(batch[0].is_success());

    orch.stop().await;
}
