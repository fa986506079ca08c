use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::MeldError;

/// Config schema version accepted by this build.
pub const SCHEMA_V1: &str = "v1";

const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 5;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 3_000;

/// Top-level configuration for the meld gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config schema version. Only "v1" is accepted.
    pub schema: String,

    /// Gateway instance name, used in logs.
    #[serde(default)]
    pub name: String,

    /// Free-form deployment version string.
    #[serde(default)]
    pub version: String,

    /// Enables debug logging.
    #[serde(default)]
    pub debug: bool,

    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-client-IP rate limiting.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// CIDRs whose X-Forwarded-* headers are honored.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Route table. At least one flow is required.
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Read/write timeout for the outer request (seconds).
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,

    /// Metrics exposition.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "prometheus" enables the /metrics endpoint; anything else is a no-op sink.
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Maximum admissions per window per client IP.
    #[serde(default = "default_rate_limit")]
    pub limit: u32,

    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Exact-match request path.
    pub path: String,

    /// Request method, matched case-insensitively.
    pub method: String,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Upper bound on concurrently running upstream calls for one request.
    /// Values below 1 fall back to 2 x CPU count.
    #[serde(default)]
    pub max_parallel_upstreams: i64,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,

    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,

    /// Tolerate a subset of upstream failures and report partial success.
    #[serde(default)]
    pub best_effort: bool,

    /// Merge-only conflict handling.
    #[serde(default)]
    pub on_conflict: ConflictConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    #[default]
    Merge,
    Array,
    /// Accepted by the parser but not implemented.
    Namespace,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default)]
    pub policy: ConflictPolicy,

    /// Upstream name whose value wins under the "prefer" policy.
    #[serde(default)]
    pub upstream: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    First,
    Error,
    Prefer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Stable name, unique within the flow. Defaults to "<method>-<hosts>".
    #[serde(default)]
    pub name: String,

    /// Interchangeable base URLs, e.g. "http://10.0.0.1:8080".
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Path appended to the selected host.
    #[serde(default)]
    pub path: String,

    /// Method for the derived sub-request. Empty = original request's method.
    #[serde(default)]
    pub method: String,

    /// Per-attempt timeout (milliseconds).
    #[serde(default = "default_upstream_timeout")]
    pub timeout_ms: u64,

    /// Header names to forward: exact, "*", or a "prefix*" glob.
    #[serde(default)]
    pub forward_headers: Vec<String>,

    /// Query keys to forward: exact, "*", or a "prefix*" glob.
    #[serde(default)]
    pub forward_queries: Vec<String>,

    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// When non-empty, statuses outside the set are treated as upstream failures.
    #[serde(default)]
    pub allowed_statuses: Vec<u16>,

    /// When true, an empty upstream body is a policy violation.
    #[serde(default)]
    pub require_body: bool,

    /// Replaces the upstream status before any downstream check.
    /// YAML keys arrive as strings and are parsed into status codes.
    #[serde(default, deserialize_with = "status_code_map")]
    pub map_status_codes: HashMap<u16, u16>,

    /// Response body cap in bytes. 0 = unlimited.
    #[serde(default)]
    pub max_response_body_size: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,

    /// Statuses (after mapping) that trigger another attempt.
    #[serde(default)]
    pub retry_on_statuses: Vec<u16>,

    /// Sleep between attempts (milliseconds). The sleep is cancellable.
    #[serde(default)]
    pub backoff_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Consecutive breaker-failures before the circuit opens.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Open -> half-open probe delay (milliseconds).
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub mode: LoadBalancingMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    #[default]
    None,
    RoundRobin,
    LeastConns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    pub name: String,

    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Only "file" sources dispatch to the script worker.
    pub source: String,

    #[serde(default)]
    pub path: String,
}

impl Config {
    /// Load configuration from a YAML file plus MELD_-prefixed environment
    /// overrides (MELD_SERVER__PORT etc.), apply defaults and validate.
    ///
    /// Validation failures carry a human-readable field path and are
    /// reported before any socket is opened.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeldError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MeldError::Config(format!(
                "cannot read configuration file '{}'",
                path.display()
            )));
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext != "yaml" && ext != "yml" {
            return Err(MeldError::Config(format!(
                "unsupported configuration file extension '{ext}', expected .yaml"
            )));
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MELD_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| MeldError::Config(e.to_string()))?;

        config.ensure_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Fill defaults that depend on sibling values and cannot be expressed
    /// as plain serde defaults.
    pub fn ensure_defaults(&mut self) {
        if self.server.timeout_secs == 0 {
            self.server.timeout_secs = DEFAULT_SERVER_TIMEOUT_SECS;
        }

        let fallback_parallelism = 2 * available_cpus() as i64;

        for flow in &mut self.flows {
            if flow.max_parallel_upstreams < 1 {
                flow.max_parallel_upstreams = fallback_parallelism;
            }

            for upstream in &mut flow.upstreams {
                if upstream.timeout_ms == 0 {
                    upstream.timeout_ms = DEFAULT_UPSTREAM_TIMEOUT_MS;
                }
            }
        }
    }

    /// Validate the configuration, collecting every problem with its field
    /// path so operators can fix a file in one pass.
    pub fn validate(&self) -> Result<(), MeldError> {
        let mut problems = Vec::new();

        if self.schema != SCHEMA_V1 {
            problems.push(format!("schema: must be '{SCHEMA_V1}'"));
        }

        if self.server.port == 0 {
            problems.push("server.port: must be between 1 and 65535".to_string());
        }

        if self.flows.is_empty() {
            problems.push("flows: must have at least 1 item".to_string());
        }

        for (i, flow) in self.flows.iter().enumerate() {
            if flow.path.is_empty() {
                problems.push(format!("flows[{i}].path: field is required"));
            }

            if flow.method.is_empty() {
                problems.push(format!("flows[{i}].method: field is required"));
            }

            if flow.upstreams.is_empty() {
                problems.push(format!("flows[{i}].upstreams: must have at least 1 item"));
            }

            if flow.aggregation.on_conflict.policy == ConflictPolicy::Prefer
                && flow.aggregation.on_conflict.upstream.is_empty()
            {
                problems.push(format!(
                    "flows[{i}].aggregation.on_conflict.upstream: field is required for the 'prefer' policy"
                ));
            }

            for (j, upstream) in flow.upstreams.iter().enumerate() {
                if upstream.hosts.is_empty() {
                    problems.push(format!(
                        "flows[{i}].upstreams[{j}].hosts: must have at least 1 item"
                    ));
                }

                for (k, host) in upstream.hosts.iter().enumerate() {
                    if host.is_empty() {
                        problems.push(format!(
                            "flows[{i}].upstreams[{j}].hosts[{k}]: must be a valid URL"
                        ));
                    }
                }
            }

            for (j, script) in flow.scripts.iter().enumerate() {
                if script.source != "file" && script.source != "builtin" {
                    problems.push(format!(
                        "flows[{i}].scripts[{j}].source: must be one of [builtin file]"
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MeldError::Config(problems.join("\n")))
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_secs: default_server_timeout(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_rate_limit(),
            window_secs: default_rate_window(),
        }
    }
}

fn status_code_map<'de, D>(deserializer: D) -> Result<HashMap<u16, u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: HashMap<String, u16> = HashMap::deserialize(deserializer)?;

    raw.into_iter()
        .map(|(key, value)| {
            key.parse::<u16>()
                .map(|status| (status, value))
                .map_err(|_| {
                    serde::de::Error::custom(format!("invalid status code key '{key}'"))
                })
        })
        .collect()
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// Serde default functions

fn default_port() -> u16 {
    8080
}

fn default_server_timeout() -> u64 {
    DEFAULT_SERVER_TIMEOUT_SECS
}

fn default_upstream_timeout() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_window() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    30_000
}
