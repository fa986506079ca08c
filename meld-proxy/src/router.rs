use axum::body::Body;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use meld_core::response::{
    ClientError, ClientResponse, CLIENT_ERR_ABORTED, CLIENT_ERR_INTERNAL,
    CLIENT_ERR_PAYLOAD_TOO_LARGE, CLIENT_ERR_RATE_LIMIT_EXCEEDED,
};
use meld_observability::{FailReason, Metrics};
use meld_plugin::{MiddlewareAction, PluginContext, PluginKind, RequestData, ResponseData};

use crate::aggregator::Aggregator;
use crate::builder::Flow;
use crate::dispatcher::Dispatcher;
use crate::rate_limit::RateLimiter;
use crate::script;

/// Hard cap on a buffered inbound request body.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

const REQUEST_ID_HEADER: &str = "x-request-id";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// The gateway's request pipeline: flow matching, rate limiting,
/// middleware and plugin phases, upstream dispatch and aggregation.
pub struct FlowRouter {
    flows: Vec<Flow>,
    dispatcher: Arc<dyn Dispatcher>,
    aggregator: Arc<dyn Aggregator>,
    rate_limiter: Option<RateLimiter>,
    metrics: Arc<dyn Metrics>,
    request_ids: Mutex<ulid::Generator>,
}

impl std::fmt::Debug for FlowRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRouter")
            .field("flows", &self.flows.len())
            .finish_non_exhaustive()
    }
}

impl FlowRouter {
    pub fn new(
        flows: Vec<Flow>,
        dispatcher: Arc<dyn Dispatcher>,
        aggregator: Arc<dyn Aggregator>,
        rate_limiter: Option<RateLimiter>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            flows,
            dispatcher,
            aggregator,
            rate_limiter,
            metrics,
            request_ids: Mutex::new(ulid::Generator::new()),
        }
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Entry point for one client request.
    pub async fn handle(
        &self,
        request: Request<Body>,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<Body> {
        self.metrics.inc_requests_total();
        let _in_flight = InFlightGuard::new(Arc::clone(&self.metrics));
        let started = Instant::now();

        let (parts, body) = request.into_parts();
        let method = parts.method.as_str().to_string();
        let path = parts.uri.path().to_string();

        let Some(flow) = self.flows.iter().find(|f| f.matches(&method, &path)) else {
            error!(method = %method, path = %path, "no flow matched");
            self.metrics.inc_failed_requests(FailReason::NoMatchedFlow);

            return not_found();
        };

        let client_ip = extract_client_ip(&parts.headers, &remote_addr);

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&client_ip) {
                return write_error(
                    CLIENT_ERR_RATE_LIMIT_EXCEEDED,
                    StatusCode::TOO_MANY_REQUESTS,
                );
            }
        }

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let mut ctx = PluginContext::new(RequestData {
            method,
            path: path.clone(),
            query: parts.uri.query().unwrap_or("").to_string(),
            headers: parts.headers.clone(),
            body: Bytes::new(),
            remote_addr: remote_addr.to_string(),
            host,
            tls: false,
            client_ip,
        });

        // Middlewares compose around the core handler; index 0 is outermost.
        let mut entered = 0;
        for (i, middleware) in flow.middlewares.iter().enumerate() {
            match middleware.before(&mut ctx) {
                MiddlewareAction::Continue => entered = i + 1,
                MiddlewareAction::ShortCircuit {
                    status,
                    headers,
                    body,
                } => {
                    debug!(middleware = middleware.name(), status, "middleware short-circuit");
                    ctx.response = Some(ResponseData {
                        status,
                        headers,
                        body,
                    });
                    break;
                }
            }
        }

        if ctx.response.is_none() {
            let start = Instant::now();
            self.run_core(flow, &mut ctx, body, &cancel).await;
            self.metrics.observe_request_duration(
                &flow.path,
                &flow.method,
                start.elapsed().as_secs_f64(),
            );
        }

        for middleware in flow.middlewares[..entered].iter().rev() {
            middleware.after(&mut ctx);
        }

        let response = ctx.response.take().unwrap_or_else(|| {
            error!("request finished without a response");
            error_response_data(CLIENT_ERR_INTERNAL, StatusCode::INTERNAL_SERVER_ERROR)
        });

        self.metrics.inc_responses_total(&flow.path, response.status);

        info!(
            method = %ctx.request.method,
            path = %flow.path,
            status = response.status,
            latency_ms = started.elapsed().as_secs_f64() * 1000.0,
            client_ip = %ctx.request.client_ip,
            request_id = %ctx.request_id,
            "access"
        );

        into_http_response(response)
    }

    /// The core handler wrapped by the flow's middlewares. Fills
    /// `ctx.response` on every path.
    async fn run_core(
        &self,
        flow: &Flow,
        ctx: &mut PluginContext,
        body: Body,
        cancel: &CancellationToken,
    ) {
        if ctx.request_id.is_empty() {
            ctx.request_id = match ctx
                .request
                .header(REQUEST_ID_HEADER)
                .filter(|v| !v.is_empty())
            {
                Some(inbound) => inbound.to_string(),
                None => self.next_request_id(),
            };
        }

        // Request-phase plugins.
        for plugin in &flow.plugins {
            if plugin.kind() != PluginKind::Request {
                continue;
            }

            debug!(plugin = plugin.name(), "executing request plugin");

            if let Err(err) = plugin.execute(ctx).await {
                error!(plugin = plugin.name(), error = %err, "request plugin failed");
                self.metrics.inc_failed_requests(FailReason::GatewayError);
                ctx.response = Some(error_response_data(
                    CLIENT_ERR_INTERNAL,
                    StatusCode::INTERNAL_SERVER_ERROR,
                ));
                return;
            }
        }

        // Script worker hook.
        for script_cfg in &flow.scripts {
            if script_cfg.source != "file" {
                continue;
            }

            let script_response = match script::send(&ctx.request, &ctx.request_id).await {
                Ok(resp) => resp,
                Err(err) => {
                    error!(request_id = %ctx.request_id, error = %err, "script worker request failed");
                    ctx.response = Some(error_response_data(
                        CLIENT_ERR_INTERNAL,
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ));
                    return;
                }
            };

            match script_response.action.as_str() {
                script::SCRIPT_ACTION_CONTINUE => {
                    script_response.apply_to(&mut ctx.request);
                }
                script::SCRIPT_ACTION_ABORT => {
                    error!(request_id = %ctx.request_id, "script worker aborted request");
                    let status = StatusCode::from_u16(script_response.status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.response = Some(error_response_data(CLIENT_ERR_ABORTED, status));
                    return;
                }
                unknown => {
                    error!(action = unknown, "unknown action from script worker");
                    ctx.response = Some(error_response_data(
                        CLIENT_ERR_INTERNAL,
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ));
                    return;
                }
            }
        }

        // Buffer the inbound body under the process-wide cap.
        match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
            Ok(bytes) => ctx.request.body = bytes,
            Err(err) => {
                error!(error = %err, max_body_size = MAX_BODY_SIZE, "failed to buffer request body");
                self.metrics.inc_failed_requests(FailReason::BodyTooLarge);
                ctx.response = Some(error_response_data(
                    CLIENT_ERR_PAYLOAD_TOO_LARGE,
                    StatusCode::PAYLOAD_TOO_LARGE,
                ));
                return;
            }
        }

        // Parallel fan-out; results arrive in upstream-declaration order.
        let original = Arc::new(ctx.request.clone());
        let responses = self.dispatcher.dispatch(flow, original, cancel).await;

        debug!(
            request_id = %ctx.request_id,
            upstreams = responses.len(),
            "dispatched responses"
        );

        // Upstream response headers, later upstreams winning per key, then
        // the unconditional gateway headers.
        let mut headers = HeaderMap::new();
        for resp in &responses {
            for name in resp.headers.keys() {
                if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                    continue;
                }
                headers.remove(name);
            }
            for (name, value) in resp.headers.iter() {
                if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }

        if let Ok(value) = HeaderValue::try_from(ctx.request_id.as_str()) {
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

        let aggregated = self.aggregator.aggregate(responses, &flow.aggregation);

        debug!(
            request_id = %ctx.request_id,
            partial = aggregated.partial,
            errors = aggregated.errors.len(),
            "aggregated responses"
        );

        let status = if aggregated.partial {
            StatusCode::PARTIAL_CONTENT
        } else if !aggregated.errors.is_empty() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };

        let envelope = ClientResponse {
            data: aggregated.data,
            errors: aggregated.errors,
        };

        ctx.response = Some(ResponseData {
            status: status.as_u16(),
            headers,
            body: Some(Bytes::from(envelope.to_bytes())),
        });

        // Response-phase plugins.
        for plugin in &flow.plugins {
            if plugin.kind() != PluginKind::Response {
                continue;
            }

            debug!(plugin = plugin.name(), "executing response plugin");

            if let Err(err) = plugin.execute(ctx).await {
                error!(plugin = plugin.name(), error = %err, "response plugin failed");
                self.metrics.inc_failed_requests(FailReason::GatewayError);
                ctx.response = Some(error_response_data(
                    CLIENT_ERR_INTERNAL,
                    StatusCode::INTERNAL_SERVER_ERROR,
                ));
                return;
            }
        }
    }

    /// Lowercase monotonic ULID; falls back to a fresh ULID if the
    /// generator overflows within one millisecond.
    fn next_request_id(&self) -> String {
        let mut generator = self.request_ids.lock().expect("request id lock");
        let id = generator.generate().unwrap_or_else(|_| ulid::Ulid::new());
        id.to_string().to_lowercase()
    }
}

/// Decrements the in-flight gauge when the request ends, on every path.
struct InFlightGuard {
    metrics: Arc<dyn Metrics>,
}

impl InFlightGuard {
    fn new(metrics: Arc<dyn Metrics>) -> Self {
        metrics.inc_requests_in_flight();
        Self { metrics }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.dec_requests_in_flight();
    }
}

/// Client IP precedence: first X-Forwarded-For hop, then X-Real-IP, then
/// the socket peer.
fn extract_client_ip(headers: &HeaderMap, remote_addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(xrip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xrip.is_empty() {
            return xrip.to_string();
        }
    }

    remote_addr.ip().to_string()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from("404 page not found"))
        .expect("static response")
}

fn write_error(code: ClientError, status: StatusCode) -> Response<Body> {
    into_http_response(error_response_data(code, status))
}

fn error_response_data(code: ClientError, status: StatusCode) -> ResponseData {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

    ResponseData {
        status: status.as_u16(),
        headers,
        body: Some(Bytes::from(ClientResponse::error(code).to_bytes())),
    }
}

fn into_http_response(data: ResponseData) -> Response<Body> {
    let status =
        StatusCode::from_u16(data.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(data.headers);
    }

    let body = match data.body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    };

    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("static response")
    })
}
