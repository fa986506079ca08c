use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Why a request failed before producing an aggregated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NoMatchedFlow,
    BodyTooLarge,
    GatewayError,
    PolicyViolation,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::NoMatchedFlow => "no_matched_flow",
            FailReason::BodyTooLarge => "body_too_large",
            FailReason::GatewayError => "gateway_error",
            FailReason::PolicyViolation => "policy_violation",
        }
    }
}

/// Metrics sink contract. The router and dispatcher only ever talk to this
/// trait; the concrete sink is chosen from config at startup.
pub trait Metrics: Send + Sync {
    fn inc_requests_total(&self);
    fn inc_requests_in_flight(&self);
    fn dec_requests_in_flight(&self);
    fn inc_failed_requests(&self, reason: FailReason);
    fn observe_request_duration(&self, path: &str, method: &str, seconds: f64);
    fn inc_responses_total(&self, path: &str, status: u16);
    fn observe_upstream_latency(&self, upstream: &str, seconds: f64);

    /// Prometheus text exposition. Empty for sinks that do not expose.
    fn gather_text(&self) -> String {
        String::new()
    }
}

/// No-op sink used when metrics are disabled.
pub struct NopMetrics;

impl Metrics for NopMetrics {
    fn inc_requests_total(&self) {}
    fn inc_requests_in_flight(&self) {}
    fn dec_requests_in_flight(&self) {}
    fn inc_failed_requests(&self, _reason: FailReason) {}
    fn observe_request_duration(&self, _path: &str, _method: &str, _seconds: f64) {}
    fn inc_responses_total(&self, _path: &str, _status: u16) {}
    fn observe_upstream_latency(&self, _upstream: &str, _seconds: f64) {}
}

/// Prometheus-backed sink with its own registry, scraped via /metrics.
pub struct PrometheusMetrics {
    registry: Registry,

    requests_total: IntCounter,
    requests_in_flight: IntGauge,
    failed_requests_total: IntCounterVec,
    request_duration: HistogramVec,
    responses_total: IntCounterVec,
    upstream_latency: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "meld_requests_total",
            "Total requests accepted by the gateway",
        ))?;

        let requests_in_flight = IntGauge::new(
            "meld_requests_in_flight",
            "Requests currently being processed",
        )?;

        let failed_requests_total = IntCounterVec::new(
            Opts::new(
                "meld_failed_requests_total",
                "Requests that failed before aggregation",
            ),
            &["reason"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("meld_request_duration_seconds", "Request latency").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["path", "method"],
        )?;

        let responses_total = IntCounterVec::new(
            Opts::new("meld_responses_total", "Responses written, by status"),
            &["path", "status"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("meld_upstream_latency_seconds", "Upstream call latency").buckets(
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
            &["upstream"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_in_flight.clone()))?;
        registry.register(Box::new(failed_requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_in_flight,
            failed_requests_total,
            request_duration,
            responses_total,
            upstream_latency,
        })
    }
}

impl Metrics for PrometheusMetrics {
    fn inc_requests_total(&self) {
        self.requests_total.inc();
    }

    fn inc_requests_in_flight(&self) {
        self.requests_in_flight.inc();
    }

    fn dec_requests_in_flight(&self) {
        self.requests_in_flight.dec();
    }

    fn inc_failed_requests(&self, reason: FailReason) {
        self.failed_requests_total
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    fn observe_request_duration(&self, path: &str, method: &str, seconds: f64) {
        self.request_duration
            .with_label_values(&[path, method])
            .observe(seconds);
    }

    fn inc_responses_total(&self, path: &str, status: u16) {
        self.responses_total
            .with_label_values(&[path, &status.to_string()])
            .inc();
    }

    fn observe_upstream_latency(&self, upstream: &str, seconds: f64) {
        self.upstream_latency
            .with_label_values(&[upstream])
            .observe(seconds);
    }

    fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
