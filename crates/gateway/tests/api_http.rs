//! HTTP surface through the real router, driven with `tower::ServiceExt`.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use mh_gateway::api;
use mh_gateway::runtime::error::SERVER_NOT_FOUND;
use mh_gateway::state::AppState;
use mh_mcp_client::protocol::{INVALID_REQUEST, PARSE_ERROR};

fn app(state: &AppState) -> Router {
    api::router().with_state(state.clone())
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_server_counts() {
    let state = state(config(vec![("fs", sh("true"))]));
    let (status, _, body) = send(app(&state), get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["servers"]["total"], 1);
    assert_eq!(body["servers"]["running"], 0);
}

#[tokio::test]
async fn rpc_errors_are_json_rpc_envelopes() {
    let state = state(config(vec![]));

    let req = json!({"jsonrpc": "2.0", "id": "abc", "method": "tools/list"});
    let (status, _, body) = send(app(&state), post_json("/v1/rpc/nope", req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "abc");
    assert_eq!(body["error"]["code"], SERVER_NOT_FOUND);

    let bad_version = json!({"jsonrpc": "1.0", "id": 4, "method": "tools/list"});
    let (_, _, body) = send(app(&state), post_json("/v1/rpc/nope", bad_version)).await;
    assert_eq!(body["id"], 4);
    assert_eq!(body["error"]["code"], INVALID_REQUEST);

    let garbage = Request::post("/v1/rpc/nope").body(Body::from("{not json")).unwrap();
    let (status, _, body) = send(app(&state), garbage).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["error"]["code"], PARSE_ERROR);
}

#[tokio::test]
async fn notification_to_unknown_server_is_404() {
    let state = state(config(vec![]));
    let note = json!({"jsonrpc": "2.0", "method": "notifications/cancelled"});
    let (status, _, body) = send(app(&state), post_json("/v1/rpc/nope", note)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn server_and_breaker_endpoints() {
    let state = state(config(vec![("fs", sh("true"))]));

    let (status, _, body) = send(app(&state), get("/v1/servers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["servers"][0]["name"], "fs");
    assert_eq!(body["servers"][0]["state"]["status"], "stopped");

    let (status, _, body) = send(app(&state), get("/v1/servers/fs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["breaker"]["status"], "closed");
    assert_eq!(body["in_flight"], 0);

    let (status, _, _) = send(app(&state), get("/v1/servers/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(app(&state), post_json("/v1/servers/fs/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(app(&state), post_json("/v1/servers/fs/health", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, _, body) = send(app(&state), get("/v1/breakers")).await;
    let names: Vec<&str> = body["breakers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|b| b["name"].as_str())
        .collect();
    assert!(names.contains(&"fs"));
    assert!(names.contains(&"enhancement"));

    let (status, _, body) = send(app(&state), post_json("/v1/breakers/fs/reset", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");
    let (status, _, _) = send(app(&state), post_json("/v1/breakers/nope/reset", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reload_without_config_file_is_rejected() {
    let state = state(config(vec![]));
    let (status, _, _) = send(app(&state), post_json("/v1/servers/reload", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cache_and_enhance_endpoints() {
    let state = state(config(vec![]));

    let (_, _, body) = send(app(&state), get("/v1/cache/stats")).await;
    assert_eq!(body["size"], 0);
    assert_eq!(body["max_size"], 1000);
    let (_, _, body) = send(app(&state), post_json("/v1/cache/clear", json!({}))).await;
    assert_eq!(body["cleared"], 0);

    let req = json!({"prompt": "find the config file"});
    let (status, _, body) = send(app(&state), post_json("/v1/enhance", req)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["was_enhanced"], false);
    assert_eq!(body["enhanced"], "find the config file");
    assert!(body["error"].is_string());

    let (status, _, _) = send(app(&state), post_json("/v1/enhance", json!({"prompt": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, body) = send(app(&state), get("/v1/enhance/stats")).await;
    assert_eq!(body["enabled"], false);
    assert_eq!(body["fallbacks"], 1);
}

#[cfg(unix)]
mod with_backends {
    use super::*;
    use axum::routing::post;

    /// Local stand-in for an OpenAI-compatible completion endpoint.
    async fn completion_service(reply: &'static str) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                axum::Json(json!({
                    "model": "stub-model",
                    "choices": [{"message": {"role": "assistant", "content": reply}}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    /// A base URL nothing is listening on.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/v1")
    }

    fn tool_call(id: u64, prompt: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"prompt": prompt}}
        })
    }

    async fn enhanced_state(base_url: String) -> AppState {
        let mut cfg = config(vec![("echo", sh(&echo_line_server()))]);
        cfg.enhance.enabled = true;
        cfg.enhance.auto_enhance = true;
        cfg.enhance.base_url = Some(base_url);
        cfg.enhance.api_key_env = "MH_TEST_GATEWAY_NO_KEY".into();
        cfg.enhance.timeout_ms = 2_000;
        let state = state(cfg);
        state.supervisor.start("echo").await.unwrap();
        state
    }

    #[tokio::test]
    async fn lifecycle_and_proxying_over_http() {
        let state = state(config(vec![("echo", sh(&echo_line_server()))]));

        let (status, _, body) = send(app(&state), post_json("/v1/servers/echo/start", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["status"], "running");

        let (status, _, _) = send(app(&state), post_json("/v1/servers/echo/start", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let req = Request::post("/v1/rpc/echo?timeout_ms=2000")
            .header("content-type", "application/json")
            .header("x-client-id", "cli-1")
            .body(Body::from(tool_call(42, "hello").to_string()))
            .unwrap();
        let (status, headers, body) = send(app(&state), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 42);
        assert_eq!(body["result"]["request"]["params"]["arguments"]["prompt"], "hello");
        assert!(headers.get("x-mcphub-enhanced").is_none());

        let note = json!({"jsonrpc": "2.0", "method": "notifications/progress"});
        let (status, _, _) = send(app(&state), post_json("/v1/rpc/echo", note)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _, body) = send(app(&state), post_json("/v1/servers/echo/health", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);

        let (_, _, body) = send(app(&state), post_json("/v1/servers/echo/stop", json!({}))).await;
        assert_eq!(body["state"]["status"], "stopped");
    }

    #[tokio::test]
    async fn auto_enhancement_rewrites_prompt_before_forwarding() {
        let state = enhanced_state(completion_service("find every TODO in src/").await).await;

        let (_, headers, body) = send(app(&state), post_json("/v1/rpc/echo", tool_call(1, "todos?"))).await;
        let forwarded = &body["result"]["request"]["params"]["arguments"]["prompt"];
        assert_eq!(forwarded, "find every TODO in src/");

        let meta: Value =
            serde_json::from_str(headers.get("x-mcphub-enhanced").unwrap().to_str().unwrap()).unwrap();
        assert_eq!(meta["was_enhanced"], true);
        assert_eq!(meta["model"], "stub-model");

        // Explicit opt-out wins over the auto policy.
        let req = post_json("/v1/rpc/echo?enhance=false", tool_call(2, "todos?"));
        let (_, headers, body) = send(app(&state), req).await;
        assert_eq!(body["result"]["request"]["params"]["arguments"]["prompt"], "todos?");
        assert!(headers.get("x-mcphub-enhanced").is_none());

        state.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn enhance_endpoint_honours_size_ceiling() {
        let mut cfg = config(vec![]);
        cfg.enhance.enabled = true;
        cfg.enhance.base_url = Some(completion_service("rewritten").await);
        cfg.enhance.api_key_env = "MH_TEST_GATEWAY_NO_KEY".into();
        cfg.enhance.max_body_bytes = 64;
        let state = state(cfg);

        let big = "x".repeat(10 * 1024);
        let (status, _, body) = send(app(&state), post_json("/v1/enhance", json!({"prompt": big}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["was_enhanced"], false);
        assert_eq!(body["enhanced"].as_str().unwrap().len(), 10 * 1024);
        assert!(body["error"].as_str().unwrap().contains("exceeds size ceiling"));

        let (_, _, body) = send(app(&state), post_json("/v1/enhance", json!({"prompt": "short"}))).await;
        assert_eq!(body["was_enhanced"], true);
        assert_eq!(body["enhanced"], "rewritten");
    }

    #[tokio::test]
    async fn enhancement_failure_forwards_original_prompt() {
        let state = enhanced_state(dead_endpoint().await).await;

        let (status, headers, body) = send(app(&state), post_json("/v1/rpc/echo", tool_call(1, "keep me"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["request"]["params"]["arguments"]["prompt"], "keep me");

        let meta: Value =
            serde_json::from_str(headers.get("x-mcphub-enhanced").unwrap().to_str().unwrap()).unwrap();
        assert_eq!(meta["was_enhanced"], false);
        assert!(meta["error"].is_string());
        assert_eq!(state.enhancer.stats().fallbacks, 1);

        state.supervisor.shutdown_all().await;
    }
}
