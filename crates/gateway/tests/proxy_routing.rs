//! Proxy behaviour end to end: id restoration, caching, timeouts feeding
//! the breaker, duplicate in-flight ids and backend crashes.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use mh_gateway::runtime::error::{REQUEST_TIMEOUT, SERVER_NOT_RUNNING};
use mh_gateway::runtime::{BreakerStatus, ForwardOptions, GatewayError};
use mh_mcp_client::JsonRpcRequest;
use serde_json::json;

fn opts(timeout_ms: u64) -> ForwardOptions {
    ForwardOptions {
        bypass_cache: false,
        timeout_ms: Some(timeout_ms),
    }
}

#[tokio::test]
async fn restores_client_id_and_isolates_clients() {
    let state = state(config(vec![("echo", sh(&echo_line_server()))]));
    state.supervisor.start("echo").await.unwrap();

    // Two clients reuse the same id concurrently.
    let a = JsonRpcRequest::new("req-1", "tools/call", Some(json!({"name": "a"})));
    let b = JsonRpcRequest::new("req-1", "tools/call", Some(json!({"name": "b"})));
    let (ra, rb) = tokio::join!(
        state.proxy.forward("echo", "alice", a, ForwardOptions::default()),
        state.proxy.forward("echo", "bob", b, ForwardOptions::default()),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.id, json!("req-1"));
    assert_eq!(rb.id, json!("req-1"));
    let seen_a = ra.result.unwrap()["request"].clone();
    let seen_b = rb.result.unwrap()["request"].clone();
    assert_eq!(seen_a["params"]["name"], "a");
    assert_eq!(seen_b["params"]["name"], "b");
    // The backend saw distinct numeric wire ids, not the client's.
    assert!(seen_a["id"].is_u64());
    assert_ne!(seen_a["id"], seen_b["id"]);

    state.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn caches_listings_only() {
    let state = state(config(vec![("counter", sh(&counter_server()))]));
    state.supervisor.start("counter").await.unwrap();
    let proxy = &state.proxy;

    let list = |id: u64| JsonRpcRequest::new(id, "tools/list", None);
    let first = proxy.forward("counter", "c", list(1), ForwardOptions::default()).await.unwrap();
    let second = proxy.forward("counter", "c", list(2), ForwardOptions::default()).await.unwrap();
    assert_eq!(first.result, second.result);
    assert_eq!(second.id, json!(2));

    let bypass = ForwardOptions {
        bypass_cache: true,
        timeout_ms: None,
    };
    let fresh = proxy.forward("counter", "c", list(3), bypass).await.unwrap();
    assert_ne!(fresh.result, first.result);

    let call = |id: u64| JsonRpcRequest::new(id, "tools/call", Some(json!({"name": "x"})));
    let c1 = proxy.forward("counter", "c", call(4), ForwardOptions::default()).await.unwrap();
    let c2 = proxy.forward("counter", "c", call(5), ForwardOptions::default()).await.unwrap();
    assert_ne!(c1.result, c2.result);

    let stats = state.cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.hits, 1);

    state.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn timeouts_open_the_circuit_without_touching_other_servers() {
    let mut cfg = config(vec![
        ("slow", sh(&hang_after_handshake())),
        ("counter", sh(&counter_server())),
    ]);
    cfg.breaker.failure_threshold = 2;
    let state = state(cfg);
    state.supervisor.start_all().await;

    for id in 0..2u64 {
        let req = JsonRpcRequest::new(id, "tools/call", None);
        let err = state.proxy.forward("slow", "c", req, opts(100)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(err.rpc_code(), REQUEST_TIMEOUT);
    }
    assert_eq!(state.supervisor.in_flight("slow"), 0);
    assert_eq!(state.supervisor.breaker("slow").status(), BreakerStatus::Open);

    let req = JsonRpcRequest::new(9, "tools/call", None);
    match state.proxy.forward("slow", "c", req, opts(100)).await {
        Err(GatewayError::CircuitOpen { retry_after, .. }) => {
            assert!(retry_after <= Duration::from_secs(30));
            assert!(retry_after > Duration::from_secs(25));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    let ok = JsonRpcRequest::new(1, "tools/call", None);
    assert!(state.proxy.forward("counter", "c", ok, opts(2_000)).await.is_ok());
    assert_eq!(state.supervisor.breaker("counter").status(), BreakerStatus::Closed);

    state.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let state = state(config(vec![("slow", sh(&hang_after_handshake()))]));
    state.supervisor.start("slow").await.unwrap();

    let proxy = state.proxy.clone();
    let first = tokio::spawn(async move {
        let req = JsonRpcRequest::new(7, "tools/call", None);
        proxy.forward("slow", "alice", req, opts(500)).await
    });
    let claimed = eventually(Duration::from_secs(2), || {
        let sup = state.supervisor.clone();
        async move { sup.in_flight("slow") == 1 }
    })
    .await;
    assert!(claimed);

    let dup = JsonRpcRequest::new(7, "tools/call", None);
    let err = state.proxy.forward("slow", "alice", dup, opts(100)).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));

    assert!(matches!(first.await.unwrap(), Err(GatewayError::Timeout { .. })));

    // Released after the first call finished.
    let again = JsonRpcRequest::new(7, "tools/call", None);
    let err = state.proxy.forward("slow", "alice", again, opts(50)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));

    state.supervisor.shutdown_all().await;
}

#[tokio::test]
async fn backend_crash_fails_the_pending_call() {
    let mut server = sh(&crash_on_request());
    server.restart_on_failure = false;
    let state = state(config(vec![("crashy", server)]));
    state.supervisor.start("crashy").await.unwrap();

    let req = JsonRpcRequest::new("x", "tools/call", None);
    let err = state.proxy.forward("crashy", "c", req, opts(5_000)).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamProcessCrash(_)));
    assert_eq!(err.rpc_code(), SERVER_NOT_RUNNING);
    assert_eq!(state.supervisor.breaker("crashy").consecutive_failures(), 1);

    let envelope = err.into_response(json!("x"));
    assert_eq!(envelope.id, json!("x"));
    assert_eq!(envelope.error.unwrap().code, SERVER_NOT_RUNNING);
}
