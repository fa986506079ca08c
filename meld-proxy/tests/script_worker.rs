//! End-to-end coverage of the out-of-process script worker hook: the
//! continue action rewrites the in-flight request, abort stops it.

mod common;

use axum::extract::Request;
use axum::routing::any;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use meld_core::config::{
    AggregationConfig, AggregationStrategy, Config, FlowConfig, PolicyConfig, ScriptConfig,
    UpstreamConfig,
};
use meld_observability::{Metrics, NopMetrics};
use meld_plugin::PluginRegistry;
use meld_proxy::script::SCRIPT_WORKER_SOCKET_PATH;
use meld_proxy::server::{build_app, AppState};

use common::spawn_backend;

/// Worker that aborts /abort-me and rewrites the query for everything else.
async fn spawn_script_worker() {
    let _ = std::fs::remove_file(SCRIPT_WORKER_SOCKET_PATH);
    let listener = UnixListener::bind(SCRIPT_WORKER_SOCKET_PATH).expect("bind script socket");

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };

            tokio::spawn(async move {
                let mut buf = vec![0u8; 1 << 20];
                let n = conn.read(&mut buf).await.unwrap();
                let request: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();

                let reply = if request["path"] == "/abort-me" {
                    json!({
                        "action": "abort",
                        "status": 403,
                        "error": "blocked by script",
                        "request_id": request["request_id"],
                        "method": request["method"],
                        "path": request["path"],
                        "query": request["query"],
                        "headers": request["headers"],
                        "body": null,
                        "client_ip": request["client_ip"],
                    })
                } else {
                    json!({
                        "action": "continue",
                        "status": 0,
                        "error": "",
                        "request_id": request["request_id"],
                        "method": request["method"],
                        "path": request["path"],
                        "query": "flag=on",
                        "headers": request["headers"],
                        "body": null,
                        "client_ip": request["client_ip"],
                    })
                };

                conn.write_all(reply.to_string().as_bytes()).await.unwrap();
            });
        }
    });
}

#[tokio::test]
async fn script_worker_rewrites_and_aborts_requests() {
    spawn_script_worker().await;

    let echo = spawn_backend(Router::new().fallback_service(any(|req: Request| async move {
        format!(r#""{}""#, req.uri().query().unwrap_or(""))
    })))
    .await;

    let upstream = UpstreamConfig {
        name: "echo".to_string(),
        hosts: vec![echo],
        path: "/".to_string(),
        method: "GET".to_string(),
        timeout_ms: 500,
        forward_headers: vec![],
        forward_queries: vec!["*".to_string()],
        policy: PolicyConfig::default(),
    };

    let scripted_flow = |path: &str| FlowConfig {
        path: path.to_string(),
        method: "GET".to_string(),
        aggregation: AggregationConfig {
            strategy: AggregationStrategy::Array,
            best_effort: false,
            on_conflict: Default::default(),
        },
        max_parallel_upstreams: 2,
        upstreams: vec![upstream.clone()],
        plugins: vec![],
        middlewares: vec![],
        scripts: vec![ScriptConfig {
            source: "file".to_string(),
            path: String::new(),
        }],
    };

    let config = Config {
        schema: "v1".to_string(),
        name: "scripted".to_string(),
        version: "0".to_string(),
        debug: false,
        server: Default::default(),
        rate_limiter: Default::default(),
        trusted_proxies: vec![],
        flows: vec![scripted_flow("/rewrite-me"), scripted_flow("/abort-me")],
    };

    let registry = PluginRegistry::new();
    let metrics: Arc<dyn Metrics> = Arc::new(NopMetrics);
    let router = Arc::new(meld_proxy::build_router(&config, &registry, metrics.clone()).unwrap());

    let app = build_app(
        AppState {
            router,
            metrics,
            shutdown: CancellationToken::new(),
        },
        false,
        Duration::from_secs(5),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let gateway = format!("http://{addr}");

    // Continue: the worker rewrote the query, the upstream echoed it back.
    // A single-upstream flow forwards the body verbatim, so data is the
    // bare echoed string.
    let response = reqwest::get(format!("{gateway}/rewrite-me?flag=off"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["data"], serde_json::json!("flag=on"));

    // Abort: the worker's status and the ABORTED code surface unchanged.
    let response = reqwest::get(format!("{gateway}/abort-me")).await.unwrap();
    assert_eq!(response.status(), 403);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json, serde_json::json!({"errors": ["ABORTED"]}));

    let _ = std::fs::remove_file(SCRIPT_WORKER_SOCKET_PATH);
}
