use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::Method;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use meld_core::config::{LoadBalancingMode, UpstreamConfig};
use meld_core::flow::Policy;
use meld_plugin::RequestData;

use crate::circuit_breaker::CircuitBreaker;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Internal failure taxonomy for one upstream call. The kind routes
/// retry/breaker/aggregation decisions; the cause is logged, never
/// returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    Canceled,
    Connection,
    BadStatus,
    ReadError,
    BodyTooLarge,
    CircuitOpen,
    Internal,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::Canceled => "canceled",
            UpstreamErrorKind::Connection => "connection",
            UpstreamErrorKind::BadStatus => "bad_status",
            UpstreamErrorKind::ReadError => "read_error",
            UpstreamErrorKind::BodyTooLarge => "body_too_large",
            UpstreamErrorKind::CircuitOpen => "circuit_open",
            UpstreamErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    /// Original cause. Not for the client.
    pub cause: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// Whether this failure advances the circuit breaker toward Open.
    /// Cancellation originating from the caller never counts.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::Timeout
                | UpstreamErrorKind::Connection
                | UpstreamErrorKind::BadStatus
        )
    }
}

/// Outcome of one upstream call after retries. `err` and a meaningful
/// body are mutually exclusive from the client's point of view.
#[derive(Debug, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub err: Option<UpstreamError>,
}

impl UpstreamResponse {
    pub fn from_error(err: UpstreamError) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }
}

/// A logical backend: one or more interchangeable hosts behind a single
/// resiliency policy.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> &Policy;

    /// Perform the full call including retries, breaker gating and backoff.
    async fn call(&self, cancel: &CancellationToken, original: &RequestData) -> UpstreamResponse;
}

/// HTTP implementation of [`Upstream`].
pub struct HttpUpstream {
    id: String,
    name: String,
    hosts: Vec<String>,
    path: String,
    /// None = fall back to the original request's method.
    method: Option<Method>,
    timeout: Duration,
    forward_headers: Vec<String>,
    forward_queries: Vec<String>,
    trusted_proxies: Arc<Vec<IpNet>>,
    policy: Policy,

    round_robin_cursor: AtomicU64,
    active_connections: Vec<AtomicI64>,

    circuit_breaker: Option<CircuitBreaker>,

    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(
        cfg: &UpstreamConfig,
        name: String,
        trusted_proxies: Arc<Vec<IpNet>>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let method = if cfg.method.is_empty() {
            None
        } else {
            Some(
                Method::from_bytes(cfg.method.to_uppercase().as_bytes())
                    .map_err(|e| anyhow::anyhow!("upstream '{name}': invalid method: {e}"))?,
            )
        };

        let policy = Policy::from(&cfg.policy);

        let circuit_breaker = policy.circuit_breaker.enabled.then(|| {
            CircuitBreaker::new(
                policy.circuit_breaker.max_failures,
                policy.circuit_breaker.reset_timeout,
            )
        });

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            hosts: cfg.hosts.clone(),
            path: cfg.path.clone(),
            method,
            timeout: Duration::from_millis(cfg.timeout_ms),
            forward_headers: cfg.forward_headers.clone(),
            forward_queries: cfg.forward_queries.clone(),
            trusted_proxies,
            policy,
            round_robin_cursor: AtomicU64::new(0),
            active_connections: cfg.hosts.iter().map(|_| AtomicI64::new(0)).collect(),
            circuit_breaker,
            client,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One attempt: select a host, build and send the request, read the
    /// body through the size limit, then apply the status/body policy.
    async fn call_once(
        &self,
        cancel: &CancellationToken,
        original: &RequestData,
    ) -> UpstreamResponse {
        let selected = self.select_host();

        let _conn_guard = (self.policy.load_balancing == LoadBalancingMode::LeastConns)
            .then(|| ConnectionGuard::acquire(&self.active_connections[selected]));

        let request = match self.build_request(original, &self.hosts[selected]) {
            Ok(r) => r,
            Err(err) => {
                return UpstreamResponse::from_error(UpstreamError::new(
                    UpstreamErrorKind::Internal,
                    err.to_string(),
                ))
            }
        };

        let mut response = tokio::select! {
            _ = cancel.cancelled() => {
                return UpstreamResponse::from_error(UpstreamError::new(
                    UpstreamErrorKind::Canceled,
                    "request canceled",
                ))
            }
            outcome = tokio::time::timeout(self.timeout, self.exchange(request)) => match outcome {
                Ok(resp) => resp,
                Err(_) => UpstreamResponse::from_error(UpstreamError::new(
                    UpstreamErrorKind::Timeout,
                    format!("attempt exceeded {:?}", self.timeout),
                )),
            },
        };

        if response.err.is_none() {
            self.apply_policy(&mut response);
        }

        response
    }

    /// Send the request and read the response body, bounded by
    /// `max_response_body_size` when the limit is positive.
    async fn exchange(&self, request: reqwest::Request) -> UpstreamResponse {
        let mut uresp = UpstreamResponse::default();

        let mut response = match self.client.execute(request).await {
            Ok(r) => r,
            Err(err) => {
                let kind = if err.is_timeout() {
                    UpstreamErrorKind::Timeout
                } else {
                    UpstreamErrorKind::Connection
                };

                uresp.err = Some(UpstreamError::new(kind, err.to_string()));
                return uresp;
            }
        };

        uresp.status = response.status().as_u16();

        if uresp.status >= 500 {
            uresp.err = Some(UpstreamError::new(
                UpstreamErrorKind::BadStatus,
                "upstream error",
            ));
            return uresp;
        }

        uresp.headers = response.headers().clone();

        let limit = self.policy.max_response_body_size;
        let mut body = Vec::new();

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    body.extend_from_slice(&chunk);

                    if limit > 0 && body.len() as u64 > limit {
                        uresp.err = Some(UpstreamError::new(
                            UpstreamErrorKind::BodyTooLarge,
                            format!("response body larger than limit of {limit} bytes"),
                        ));
                        return uresp;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    uresp.err = Some(UpstreamError::new(
                        UpstreamErrorKind::ReadError,
                        err.to_string(),
                    ));
                    return uresp;
                }
            }
        }

        uresp.body = Some(Bytes::from(body));
        uresp
    }

    /// Status mapping runs before every other check so the mapped value
    /// participates in retry evaluation and the allowed-status policy.
    fn apply_policy(&self, response: &mut UpstreamResponse) {
        if let Some(mapped) = self.policy.map_status_codes.get(&response.status) {
            response.status = *mapped;
        }

        if self.policy.require_body && response.body.as_ref().is_none_or(|b| b.is_empty()) {
            response.err = Some(UpstreamError::new(
                UpstreamErrorKind::BadStatus,
                "empty body not allowed by upstream policy",
            ));
            return;
        }

        if !self.policy.allowed_statuses.is_empty()
            && !self.policy.allowed_statuses.contains(&response.status)
        {
            response.err = Some(UpstreamError::new(
                UpstreamErrorKind::BadStatus,
                "status not allowed by upstream policy",
            ));
        }
    }

    /// Index of the host the next attempt goes to.
    fn select_host(&self) -> usize {
        if self.hosts.len() == 1 {
            return 0;
        }

        match self.policy.load_balancing {
            LoadBalancingMode::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) + 1;
                (idx % self.hosts.len() as u64) as usize
            }
            LoadBalancingMode::LeastConns => {
                let mut best = 0;
                let mut min_active = i64::MAX;

                for (i, active) in self.active_connections.iter().enumerate() {
                    let current = active.load(Ordering::Relaxed);
                    if current < min_active {
                        min_active = current;
                        best = i;
                    }
                }

                best
            }
            LoadBalancingMode::None => 0,
        }
    }

    fn build_request(
        &self,
        original: &RequestData,
        target_host: &str,
    ) -> anyhow::Result<reqwest::Request> {
        let trimmed_path = self.path.trim_start_matches('/');
        let url = if target_host.ends_with('/') {
            format!("{target_host}{trimmed_path}")
        } else {
            format!("{target_host}/{trimmed_path}")
        };

        let method = match &self.method {
            Some(m) => m.clone(),
            None => Method::from_bytes(original.method.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid original method: {e}"))?,
        };

        // Request bodies only travel on body-accepting methods.
        let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            original.body.clone()
        } else {
            Bytes::new()
        };

        let mut url: reqwest::Url = url
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid upstream url '{url}': {e}"))?;

        self.resolve_queries(&mut url, original);

        let headers = self.resolve_headers(original)?;

        let request = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .build()?;

        Ok(request)
    }

    /// Apply the forward_queries rules. A lone "*" copies the whole
    /// original query string; "prefix*" matches keys by prefix; a literal
    /// name forwards only when the original has a non-empty value.
    fn resolve_queries(&self, url: &mut reqwest::Url, original: &RequestData) {
        let mut forwarded: Vec<(String, String)> = Vec::new();

        for fq in &self.forward_queries {
            if fq == "*" {
                let query = if original.query.is_empty() {
                    None
                } else {
                    Some(original.query.as_str())
                };
                url.set_query(query);
                return;
            }

            if let Some(prefix) = fq.strip_suffix('*') {
                for (key, value) in original.query_pairs() {
                    if key.starts_with(prefix) {
                        forwarded.push((key, value));
                    }
                }
                continue;
            }

            if let Some(value) = original.query_value(fq) {
                forwarded.push((fq.clone(), value));
            }
        }

        if !forwarded.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &forwarded {
                pairs.append_pair(key, value);
            }
        }
    }

    /// Apply the forward_headers rules, then the Content-Type passthrough
    /// and the trusted-proxy-aware X-Forwarded-* block.
    fn resolve_headers(&self, original: &RequestData) -> anyhow::Result<HeaderMap> {
        let mut target = HeaderMap::new();

        for fw in &self.forward_headers {
            if fw == "*" {
                for (name, value) in original.headers.iter() {
                    // Hop-specific headers are owned by the client below.
                    if name == HOST || name == CONTENT_LENGTH {
                        continue;
                    }
                    target.append(name.clone(), value.clone());
                }
                break;
            }

            if let Some(prefix) = fw.strip_suffix('*') {
                let prefix = prefix.to_lowercase();

                for (name, value) in original.headers.iter() {
                    if name == HOST || name == CONTENT_LENGTH {
                        continue;
                    }
                    if name.as_str().starts_with(&prefix) {
                        target.append(name.clone(), value.clone());
                    }
                }
                continue;
            }

            if let Some(value) = original.header(fw).filter(|v| !v.is_empty()) {
                let name = HeaderName::try_from(fw.as_str())
                    .map_err(|e| anyhow::anyhow!("invalid forward header name '{fw}': {e}"))?;
                target.append(name, HeaderValue::try_from(value)?);
            }
        }

        if let Some(content_type) = original.headers.get(CONTENT_TYPE) {
            target.insert(CONTENT_TYPE, content_type.clone());
        }

        self.resolve_forwarded(&mut target, original)?;

        Ok(target)
    }

    fn resolve_forwarded(
        &self,
        target: &mut HeaderMap,
        original: &RequestData,
    ) -> anyhow::Result<()> {
        let remote_ip = parse_remote_ip(&original.remote_addr).ok_or_else(|| {
            anyhow::anyhow!("cannot parse remote address '{}'", original.remote_addr)
        })?;

        let client_ip = remote_ip.to_string();
        let proto = if original.tls { "https" } else { "http" };
        let port = resolve_port(&original.host, original.tls);

        let set = |target: &mut HeaderMap, name: &'static str, value: &str| -> anyhow::Result<()> {
            target.insert(
                HeaderName::from_static(name),
                HeaderValue::try_from(value)
                    .map_err(|e| anyhow::anyhow!("invalid {name} value: {e}"))?,
            );
            Ok(())
        };

        // Headers from untrusted peers cannot be believed, so the locally
        // derived values overwrite whatever arrived.
        if !self.is_trusted_proxy(remote_ip) {
            set(target, X_FORWARDED_FOR, &client_ip)?;
            set(target, X_FORWARDED_PROTO, proto)?;
            set(target, X_FORWARDED_HOST, &original.host)?;
            set(target, X_FORWARDED_PORT, &port)?;
            return Ok(());
        }

        match original.header(X_FORWARDED_FOR).filter(|v| !v.is_empty()) {
            Some(inbound) => set(target, X_FORWARDED_FOR, &format!("{inbound}, {client_ip}"))?,
            None => set(target, X_FORWARDED_FOR, &client_ip)?,
        }

        match original.header(X_FORWARDED_PROTO) {
            Some(inbound @ ("http" | "https")) => set(target, X_FORWARDED_PROTO, inbound)?,
            _ => set(target, X_FORWARDED_PROTO, proto)?,
        }

        match original.header(X_FORWARDED_HOST).filter(|v| !v.is_empty()) {
            Some(inbound) => set(target, X_FORWARDED_HOST, inbound)?,
            None => set(target, X_FORWARDED_HOST, &original.host)?,
        }

        match original.header(X_FORWARDED_PORT).filter(|v| !v.is_empty()) {
            Some(inbound) => set(target, X_FORWARDED_PORT, inbound)?,
            None => set(target, X_FORWARDED_PORT, &port)?,
        }

        Ok(())
    }

    fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|cidr| cidr.contains(&ip))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }

    async fn call(&self, cancel: &CancellationToken, original: &RequestData) -> UpstreamResponse {
        let retry = &self.policy.retry;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return UpstreamResponse::from_error(UpstreamError::new(
                    UpstreamErrorKind::Canceled,
                    "request canceled",
                ));
            }

            if let Some(breaker) = &self.circuit_breaker {
                if !breaker.allow() {
                    error!(upstream = %self.name, "circuit breaker denied request");

                    return UpstreamResponse::from_error(UpstreamError::new(
                        UpstreamErrorKind::CircuitOpen,
                        "upstream circuit breaker is open",
                    ));
                }
            }

            let response = self.call_once(cancel, original).await;

            if let Some(breaker) = &self.circuit_breaker {
                match &response.err {
                    Some(err) if err.is_breaker_failure() => {
                        error!(
                            upstream = %self.name,
                            kind = err.kind.as_str(),
                            cause = %err.cause,
                            "upstream request failed, advancing circuit breaker"
                        );
                        breaker.on_failure();
                    }
                    _ => breaker.on_success(),
                }
            }

            if response.err.is_none() && !retry.retry_on_statuses.contains(&response.status) {
                return response;
            }

            if attempt >= retry.max_retries {
                return response;
            }
            attempt += 1;

            debug!(upstream = %self.name, attempt, "retrying upstream request");

            if !retry.backoff_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(retry.backoff_delay) => {}
                    _ = cancel.cancelled() => {
                        // The last attempt's status is discarded on purpose.
                        return UpstreamResponse::from_error(UpstreamError::new(
                            UpstreamErrorKind::Canceled,
                            "canceled during retry backoff",
                        ));
                    }
                }
            }
        }
    }
}

/// Tracks one in-flight connection for least-conns balancing.
struct ConnectionGuard<'a> {
    counter: &'a AtomicI64,
}

impl<'a> ConnectionGuard<'a> {
    fn acquire(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

fn parse_remote_ip(remote_addr: &str) -> Option<IpAddr> {
    remote_addr
        .parse::<std::net::SocketAddr>()
        .map(|addr| addr.ip())
        .ok()
        .or_else(|| remote_addr.parse().ok())
}

/// Port from a "host:port" Host header; defaults by scheme otherwise.
fn resolve_port(host: &str, tls: bool) -> String {
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return port.to_string();
        }
    }

    if tls { "443" } else { "80" }.to_string()
}
