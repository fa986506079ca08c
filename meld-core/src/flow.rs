//! Compiled flow-graph value types.
//!
//! Everything in this module is constructed once at startup from the raw
//! [`crate::config`] structs and is read-only afterwards, so the types are
//! safe to share across request tasks without locking.

use std::collections::HashMap;
use std::time::Duration;

pub use crate::config::{AggregationStrategy, ConflictPolicy, LoadBalancingMode};
use crate::config::{PolicyConfig, UpstreamConfig};

/// Compiled aggregation settings for one flow.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub strategy: AggregationStrategy,
    pub best_effort: bool,
    /// Only meaningful for the merge strategy.
    pub conflict_policy: ConflictPolicy,
    /// Index into the flow's upstream list; set only for the prefer policy.
    pub preferred_upstream: Option<usize>,
}

impl Aggregation {
    pub fn new(strategy: AggregationStrategy, best_effort: bool) -> Self {
        Self {
            strategy,
            best_effort,
            conflict_policy: ConflictPolicy::Overwrite,
            preferred_upstream: None,
        }
    }
}

/// Compiled resiliency policy for one upstream.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub allowed_statuses: Vec<u16>,
    pub require_body: bool,
    pub map_status_codes: HashMap<u16, u16>,
    /// 0 = unlimited.
    pub max_response_body_size: u64,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub load_balancing: LoadBalancingMode,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_on_statuses: Vec<u16>,
    pub backoff_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

impl From<&PolicyConfig> for Policy {
    fn from(cfg: &PolicyConfig) -> Self {
        Self {
            allowed_statuses: cfg.allowed_statuses.clone(),
            require_body: cfg.require_body,
            map_status_codes: cfg.map_status_codes.clone(),
            max_response_body_size: cfg.max_response_body_size,
            retry: RetryPolicy {
                max_retries: cfg.retry.max_retries,
                retry_on_statuses: cfg.retry.retry_on_statuses.clone(),
                backoff_delay: Duration::from_millis(cfg.retry.backoff_delay_ms),
            },
            circuit_breaker: CircuitBreakerPolicy {
                enabled: cfg.circuit_breaker.enabled,
                max_failures: cfg.circuit_breaker.max_failures,
                reset_timeout: Duration::from_millis(cfg.circuit_breaker.reset_timeout_ms),
            },
            load_balancing: cfg.load_balancer.mode,
        }
    }
}

/// Default upstream name: "<method>-<hosts joined by ->", lowercased.
pub fn default_upstream_name(cfg: &UpstreamConfig) -> String {
    let mut name = cfg.method.to_lowercase();
    name.push('-');
    name.push_str(
        &cfg.hosts
            .iter()
            .map(|h| h.to_lowercase())
            .collect::<Vec<_>>()
            .join("-"),
    );
    name
}
