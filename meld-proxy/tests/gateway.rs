//! End-to-end tests through the real ingress: config -> compiled flows ->
//! axum server -> dispatch -> aggregation -> client envelope.

mod common;

use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use meld_core::config::{
    AggregationConfig, AggregationStrategy, Config, ConflictConfig, ConflictPolicy, FlowConfig,
    PolicyConfig, RateLimiterConfig, UpstreamConfig,
};
use meld_observability::{Metrics, PrometheusMetrics};
use meld_plugin::PluginRegistry;
use meld_proxy::server::{build_app, AppState};

use common::spawn_backend;

fn upstream(name: &str, host: &str) -> UpstreamConfig {
    UpstreamConfig {
        name: name.to_string(),
        hosts: vec![host.to_string()],
        path: "/".to_string(),
        method: "GET".to_string(),
        timeout_ms: 500,
        forward_headers: vec![],
        forward_queries: vec![],
        policy: PolicyConfig::default(),
    }
}

fn flow(path: &str, strategy: AggregationStrategy, best_effort: bool) -> FlowConfig {
    FlowConfig {
        path: path.to_string(),
        method: "GET".to_string(),
        aggregation: AggregationConfig {
            strategy,
            best_effort,
            on_conflict: ConflictConfig::default(),
        },
        max_parallel_upstreams: 8,
        upstreams: vec![],
        plugins: vec![],
        middlewares: vec![],
        scripts: vec![],
    }
}

fn base_config(flows: Vec<FlowConfig>) -> Config {
    Config {
        schema: "v1".to_string(),
        name: "gateway-under-test".to_string(),
        version: "0.0.0".to_string(),
        debug: false,
        server: Default::default(),
        rate_limiter: RateLimiterConfig::default(),
        trusted_proxies: vec![],
        flows,
    }
}

/// Boot the full gateway and return its base URL.
async fn serve_gateway(config: Config) -> String {
    let mut registry = PluginRegistry::new();
    meld_plugins::register_all(&mut registry);

    let metrics: Arc<dyn Metrics> = Arc::new(PrometheusMetrics::new().unwrap());
    let router = Arc::new(
        meld_proxy::build_router(&config, &registry, Arc::clone(&metrics)).unwrap(),
    );

    let state = AppState {
        router,
        metrics,
        shutdown: CancellationToken::new(),
    };

    let app = build_app(state, true, Duration::from_secs(5));

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

    format!("http://{addr}")
}

async fn get_json(url: &str) -> (reqwest::StatusCode, serde_json::Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    let json = response.json().await.unwrap();
    (status, json)
}

#[tokio::test]
async fn array_success_returns_ordered_data() {
    let a = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;
    let b = spawn_backend(Router::new().fallback_service(any(|| async { r#""B""# }))).await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &a), upstream("b", &b)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let (status, json) = get_json(&format!("{gateway}/orders")).await;

    assert_eq!(status, 200);
    assert_eq!(json, serde_json::json!({"data": ["A", "B"]}));
}

#[tokio::test]
async fn best_effort_timeout_yields_206_partial() {
    let a = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;
    let slow = spawn_backend(Router::new().fallback_service(any(|| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        r#""B""#
    })))
    .await;

    let mut f = flow("/orders", AggregationStrategy::Array, true);
    f.upstreams = vec![upstream("a", &a), upstream("slow", &slow)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let (status, json) = get_json(&format!("{gateway}/orders")).await;

    assert_eq!(status, 206);
    assert_eq!(
        json,
        serde_json::json!({"data": ["A"], "errors": ["UPSTREAM_UNAVAILABLE"]})
    );
}

#[tokio::test]
async fn strict_timeout_yields_500_without_data() {
    let a = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;
    let slow = spawn_backend(Router::new().fallback_service(any(|| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        r#""B""#
    })))
    .await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &a), upstream("slow", &slow)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let (status, json) = get_json(&format!("{gateway}/orders")).await;

    assert_eq!(status, 500);
    assert_eq!(json, serde_json::json!({"errors": ["UPSTREAM_UNAVAILABLE"]}));
}

#[tokio::test]
async fn merge_overwrite_later_upstream_wins() {
    let a = spawn_backend(Router::new().fallback_service(any(|| async { r#"{"x":1,"y":2}"# }))).await;
    let b = spawn_backend(Router::new().fallback_service(any(|| async { r#"{"y":3,"z":4}"# }))).await;

    let mut f = flow("/profile", AggregationStrategy::Merge, false);
    f.upstreams = vec![upstream("a", &a), upstream("b", &b)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let (status, json) = get_json(&format!("{gateway}/profile")).await;

    assert_eq!(status, 200);
    assert_eq!(json["data"], serde_json::json!({"x":1,"y":3,"z":4}));
}

#[tokio::test]
async fn merge_prefer_keeps_preferred_upstreams_values() {
    let a = spawn_backend(Router::new().fallback_service(any(|| async { r#"{"x":1,"y":2}"# }))).await;
    let b = spawn_backend(Router::new().fallback_service(any(|| async { r#"{"y":3,"z":4}"# }))).await;

    let mut f = flow("/profile", AggregationStrategy::Merge, false);
    f.aggregation.on_conflict = ConflictConfig {
        policy: ConflictPolicy::Prefer,
        upstream: "a".to_string(),
    };
    f.upstreams = vec![upstream("a", &a), upstream("b", &b)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let (status, json) = get_json(&format!("{gateway}/profile")).await;

    assert_eq!(status, 200);
    assert_eq!(json["data"], serde_json::json!({"x":1,"y":2,"z":4}));
}

#[tokio::test]
async fn single_upstream_body_round_trips_verbatim() {
    let backend =
        spawn_backend(Router::new().fallback_service(any(|| async { r#"{"z":9,"a":{"n":[1,2]}}"# })))
            .await;

    let mut f = flow("/single", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("only", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{gateway}/single"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    // Byte-for-byte passthrough inside the envelope.
    assert_eq!(body, r#"{"data":{"z":9,"a":{"n":[1,2]}}}"#);
}

#[tokio::test]
async fn unmatched_route_is_404() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;

    let mut f = flow("/known", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let response = reqwest::get(format!("{gateway}/unknown")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let response = reqwest::get(format!("{gateway}/__health")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;

    // Generate one request before scraping.
    let _ = reqwest::get(format!("{gateway}/orders")).await.unwrap();

    let text = reqwest::get(format!("{gateway}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.contains("meld_requests_total 1"), "got:\n{text}");
    assert!(text.contains("meld_responses_total"), "got:\n{text}");
}

#[tokio::test]
async fn rate_limited_client_gets_429() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;

    let mut f = flow("/limited", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let mut config = base_config(vec![f]);
    config.rate_limiter = RateLimiterConfig {
        enabled: true,
        limit: 2,
        window_secs: 60,
    };

    let gateway = serve_gateway(config).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("{gateway}/limited")).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let (status, json) = get_json(&format!("{gateway}/limited")).await;
    assert_eq!(status, 429);
    assert_eq!(json, serde_json::json!({"errors": ["RATE_LIMIT_EXCEEDED"]}));
}

#[tokio::test]
async fn request_id_is_honored_and_echoed() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async { r#""A""# }))).await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{gateway}/orders"))
        .header("x-request-id", "trace-me-123")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "trace-me-123"
    );

    let response = client.get(format!("{gateway}/orders")).send().await.unwrap();
    let generated = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(generated.len(), 26);
    assert_eq!(generated, generated.to_lowercase());
}

#[tokio::test]
async fn untrusted_peer_forwarded_headers_are_overwritten() {
    let echo = spawn_backend(Router::new().fallback_service(any(
        |headers: http::HeaderMap| async move {
            serde_json::json!({
                "xff": headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
                "proto": headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
            })
            .to_string()
        },
    )))
    .await;

    let mut f = flow("/fwd", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("echo", &echo)];

    // No trusted proxies configured: the loopback peer is untrusted.
    let gateway = serve_gateway(base_config(vec![f])).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{gateway}/fwd"))
        .header("x-forwarded-for", "6.6.6.6")
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["data"]["xff"], "127.0.0.1");
    assert_eq!(json["data"]["proto"], "http");
}

#[tokio::test]
async fn trusted_peer_is_appended_to_forwarded_for() {
    let echo = spawn_backend(Router::new().fallback_service(any(
        |headers: http::HeaderMap| async move {
            serde_json::json!({
                "xff": headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
            })
            .to_string()
        },
    )))
    .await;

    let mut f = flow("/fwd", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("echo", &echo)];

    let mut config = base_config(vec![f]);
    config.trusted_proxies = vec!["127.0.0.0/8".to_string()];

    let gateway = serve_gateway(config).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{gateway}/fwd"))
        .header("x-forwarded-for", "6.6.6.6")
        .send()
        .await
        .unwrap();

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["data"]["xff"], "6.6.6.6, 127.0.0.1");
}

#[tokio::test]
async fn upstream_response_headers_reach_the_client() {
    let backend = spawn_backend(Router::new().fallback_service(any(|| async {
        ([("x-backend", "orders-v2")], r#""A""#)
    })))
    .await;

    let mut f = flow("/orders", AggregationStrategy::Array, false);
    f.upstreams = vec![upstream("a", &backend)];

    let gateway = serve_gateway(base_config(vec![f])).await;
    let response = reqwest::get(format!("{gateway}/orders")).await.unwrap();

    assert_eq!(response.headers().get("x-backend").unwrap(), "orders-v2");
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json; charset=utf-8"
    );
}
