use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use http::header::CONTENT_TYPE;
use http::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use meld_core::config::Config;
use meld_observability::Metrics;

use crate::router::FlowRouter;

/// Shared state for the ingress handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<FlowRouter>,
    pub metrics: Arc<dyn Metrics>,
    pub shutdown: CancellationToken,
}

/// The gateway's single HTTP listener: health endpoint, optional metrics
/// exposition, everything else routed by the flow table.
pub struct Server {
    addr: SocketAddr,
    timeout: Duration,
    metrics_enabled: bool,
    state: AppState,
}

impl Server {
    pub fn new(
        config: &Config,
        router: Arc<FlowRouter>,
        metrics: Arc<dyn Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let metrics_enabled =
            config.server.metrics.enabled && config.server.metrics.provider == "prometheus";

        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], config.server.port)),
            timeout: Duration::from_secs(config.server.timeout_secs),
            metrics_enabled,
            state: AppState {
                router,
                metrics,
                shutdown,
            },
        }
    }

    /// Build the axum application.
    pub fn app(&self) -> axum::Router {
        build_app(self.state.clone(), self.metrics_enabled, self.timeout)
    }

    /// Bind and serve until the shutdown token fires.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let shutdown = self.state.shutdown.clone();

        info!(addr = %self.addr, metrics = self.metrics_enabled, "gateway listening");

        axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

        Ok(())
    }
}

/// Build the ingress application around shared state. Split out so tests
/// can serve it on an ephemeral port.
pub fn build_app(state: AppState, metrics_enabled: bool, timeout: Duration) -> axum::Router {
    let mut app = axum::Router::new().route("/__health", get(health_handler));

    if metrics_enabled {
        app = app.route("/metrics", get(metrics_handler));
    }

    app.fallback(gateway_handler)
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.gather_text(),
    )
}

async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let cancel = state.shutdown.child_token();
    state.router.handle(request, remote_addr, cancel).await
}
