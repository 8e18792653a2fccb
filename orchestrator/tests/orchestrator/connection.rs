//! Connection manager behaviour

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tool_orchestrator::{ConnectionState, OrchestratorError};

use crate::support::{backend, config, Harness};

#[tokio::test(start_paused = true)]
async fn test_disabled_backend_is_never_connected() {
    let harness = Harness::new(&["a", "b"]);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b").disabled()]));

    let report = orch.connect_all().await.unwrap();

    assert_eq!(report.connected, vec!["a".to_string()]);
    assert!(report.failed.is_empty());
    assert!(orch.is_connected("a"));
    assert!(!orch.is_connected("b"));

    // No client handle and no breaker for the disabled backend
    assert_eq!(harness.backend("b").clients_created.load(Ordering::SeqCst), 0);
    assert!(orch.circuit("b").is_none());
    assert!(orch.circuit("a").is_some());

    let tools = orch.list_all_tools().await;
    assert_eq!(tools.keys().collect::<Vec<_>>(), vec!["a"]);
    assert!(orch.connections().iter().all(|c| c.backend != "b"));
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_is_reported_not_raised() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| b.connect_fails = true);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    let report = orch.connect_all().await.unwrap();

    assert_eq!(report.connected, vec!["b".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].backend, "a");
    assert!(report.failed[0].error.contains("connection refused"));
    assert!(report.is_usable());
    assert!(!report.is_complete());

    assert!(orch.is_connected("b"));
    assert!(!orch.is_connected("a"));
}

#[tokio::test(start_paused = true)]
async fn test_all_backends_failing_is_an_error() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| b.connect_fails = true);
    harness.backend("b").set(|b| b.connect_fails = true);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    match orch.connect_all().await {
        Err(OrchestratorError::NoBackendsAvailable { report }) => {
            assert_eq!(report.failed.len(), 2);
        }
        other => panic!("expected NoBackendsAvailable, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(start_paused = true)]
async fn test_no_enabled_backends_is_an_empty_report() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a").disabled()]));

    let report = orch.connect_all().await.unwrap();
    assert_eq!(report.attempted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_all_creates_one_handle_per_backend() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| b.connect_delay = Duration::from_millis(50));
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    let (first, second) = tokio::join!(orch.connect_all(), orch.connect_all());
    let (first, second) = (first.unwrap(), second.unwrap());

    for name in ["a", "b"] {
        let fake = harness.backend(name);
        assert_eq!(fake.clients_created.load(Ordering::SeqCst), 1, "{}", name);
        assert_eq!(fake.connects(), 1, "{}", name);
        assert_eq!(fake.live_handles.load(Ordering::SeqCst), 1, "{}", name);
    }
    assert_eq!(first.connected.len() + second.connected.len(), 2);
    assert_eq!(first.already_connected.len() + second.already_connected.len(), 2);

    // A later call is a no-op
    let third = orch.connect_all().await.unwrap();
    assert_eq!(third.already_connected.len(), 2);
    assert_eq!(harness.backend("a").connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_exactly_max_retries_times() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| b.connect_fails = true);
    let orch = harness.orchestrator(config(vec![backend("a").with_max_retries(3), backend("b")]));

    let report = orch.connect_all().await.unwrap();

    assert_eq!(harness.backend("a").connects(), 4);
    assert_eq!(report.failed[0].attempts, 4);
    assert!(!orch.is_connected("a"));
    assert_eq!(
        orch.connections().iter().find(|c| c.backend == "a").unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_backoff_is_exponential_and_capped() {
    let harness = Harness::new(&["a"]);
    harness.backend("a").set(|b| b.connect_fails = true);
    let slow = backend("a")
        .with_max_retries(4)
        .with_backoff(Duration::from_millis(100), Duration::from_millis(300));
    let orch = harness.orchestrator(config(vec![slow]));

    let started = Instant::now();
    let _ = orch.connect_all().await;

    // 100 + 200 + 300 (capped) + 300 (capped)
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    assert_eq!(harness.backend("a").connects(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_connect_attempts_respect_ceiling() {
    let harness = Harness::new(&["a", "b", "c", "d"]);
    let mut names = Vec::new();
    for name in ["a", "b", "c", "d"] {
        harness.backend(name).set(|b| b.connect_delay = Duration::from_millis(20));
        names.push(backend(name));
    }
    let mut cfg = config(names);
    cfg.max_concurrent_connects = 2;
    let orch = harness.orchestrator(cfg);

    let report = orch.connect_all().await.unwrap();

    assert_eq!(report.connected.len(), 4);
    assert_eq!(harness.max_connecting(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_the_handle() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    orch.reconnect("a").await.unwrap();

    let fake = harness.backend("a");
    assert_eq!(fake.clients_created.load(Ordering::SeqCst), 2);
    assert_eq!(fake.disconnects(), 1);
    assert_eq!(fake.live_handles.load(Ordering::SeqCst), 1);
    assert!(orch.is_connected("a"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_unknown_backend() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));

    let err = orch.reconnect("nope").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownBackend { ref backend } if backend == "nope"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_survives_failing_and_panicking_clients() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.backend("a").set(|b| b.disconnect_fails = true);
    harness.backend("b").set(|b| b.disconnect_panics = true);
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b"), backend("c")]));
    orch.connect_all().await.unwrap();

    orch.disconnect_all().await;

    for name in ["a", "b", "c"] {
        assert!(!orch.is_connected(name), "{}", name);
        assert_eq!(harness.backend(name).disconnects(), 1, "{}", name);
    }
    assert!(orch.circuit_snapshots().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_reads_as_disconnected() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    harness.backend("a").drop_sessions();

    assert!(!orch.is_connected("a"));
    let err = orch
        .call_tool("a", "a_status", serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Connection { .. }));
    assert_eq!(harness.backend("a").calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_cleanup_contains_panicking_disconnect() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| {
        b.connect_fails = true;
        b.disconnect_panics = true;
    });
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    let report = tokio::spawn({
        let orch = orch.clone();
        async move { orch.connect_all().await }
    })
    .await
    .expect("connect_all must not panic")
    .unwrap();

    assert_eq!(report.connected, vec!["b".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].backend, "a");
    assert_eq!(harness.backend("a").disconnects(), 1);
    assert!(orch.is_connected("b"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_cleanup_is_time_bounded() {
    let harness = Harness::new(&["a", "b"]);
    harness.backend("a").set(|b| {
        b.connect_fails = true;
        b.disconnect_hangs = true;
    });
    let orch = harness.orchestrator(config(vec![backend("a"), backend("b")]));

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(30), orch.connect_all())
        .await
        .expect("cleanup of a failed backend blocked connect_all")
        .unwrap();

    // Bounded by the backend timeout
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(report.connected, vec!["b".to_string()]);
    assert_eq!(report.failed[0].backend, "a");
}

#[tokio::test(start_paused = true)]
async fn test_is_connected_does_not_change_state() {
    let harness = Harness::new(&["a"]);
    let orch = harness.orchestrator(config(vec![backend("a")]));
    orch.connect_all().await.unwrap();

    harness.backend("a").drop_sessions();
    assert!(!orch.is_connected("a"));
    assert!(!orch.is_connected("a"));
    assert_eq!(orch.connections()[0].state, ConnectionState::Connected);

    // The next operation that needs the client records the loss
    orch.call_tool("a", "a_status", serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(orch.connections()[0].state, ConnectionState::Disconnected);
}
