use ipnet::IpNet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use meld_core::config::{
    AggregationConfig, AggregationStrategy, Config, ConflictPolicy, FlowConfig, ScriptConfig,
};
use meld_core::flow::{default_upstream_name, Aggregation};
use meld_observability::Metrics;
use meld_plugin::{Middleware, PluginInstance, PluginRegistry};

use crate::aggregator::DefaultAggregator;
use crate::dispatcher::DefaultDispatcher;
use crate::rate_limit::RateLimiter;
use crate::router::FlowRouter;
use crate::upstream::{HttpUpstream, Upstream};

/// A compiled route: matching rule, upstream set, aggregation and the
/// per-flow plugin/middleware chains. Immutable once built.
pub struct Flow {
    pub path: String,
    pub method: String,
    pub aggregation: Aggregation,
    pub max_parallel_upstreams: usize,
    pub upstreams: Vec<Arc<dyn Upstream>>,
    pub plugins: Vec<Box<dyn PluginInstance>>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub scripts: Vec<ScriptConfig>,
}

impl Flow {
    /// Method matches case-insensitively (empty = any), path exactly.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.is_empty() && !self.method.eq_ignore_ascii_case(method) {
            return false;
        }

        !self.path.is_empty() && self.path == path
    }
}

/// Build the complete router from validated configuration. Everything
/// that can go wrong here is a startup failure; the serving loop never
/// sees a half-built flow graph.
pub fn build_router(
    config: &Config,
    registry: &PluginRegistry,
    metrics: Arc<dyn Metrics>,
) -> anyhow::Result<FlowRouter> {
    let trusted_proxies = parse_trusted_proxies(&config.trusted_proxies)?;

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;

    let mut flows = Vec::with_capacity(config.flows.len());
    for (i, flow_cfg) in config.flows.iter().enumerate() {
        let flow = compile_flow(flow_cfg, registry, &trusted_proxies, &client)
            .map_err(|e| anyhow::anyhow!("flows[{i}]: {e}"))?;
        flows.push(flow);
    }

    let rate_limiter = if config.rate_limiter.enabled {
        let limiter = RateLimiter::new(
            config.rate_limiter.limit,
            Duration::from_secs(config.rate_limiter.window_secs),
        );
        limiter.start()?;

        info!(
            limit = config.rate_limiter.limit,
            window_secs = config.rate_limiter.window_secs,
            "rate limiter started"
        );

        Some(limiter)
    } else {
        None
    };

    info!(flows = flows.len(), "router built");

    Ok(FlowRouter::new(
        flows,
        Arc::new(DefaultDispatcher::new(Arc::clone(&metrics))),
        Arc::new(DefaultAggregator),
        rate_limiter,
        metrics,
    ))
}

fn parse_trusted_proxies(cidrs: &[String]) -> anyhow::Result<Arc<Vec<IpNet>>> {
    let mut parsed = Vec::with_capacity(cidrs.len());

    for cidr in cidrs {
        let net: IpNet = cidr
            .parse()
            .map_err(|e| anyhow::anyhow!("trusted_proxies: invalid CIDR '{cidr}': {e}"))?;
        parsed.push(net);
    }

    Ok(Arc::new(parsed))
}

fn compile_flow(
    cfg: &FlowConfig,
    registry: &PluginRegistry,
    trusted_proxies: &Arc<Vec<IpNet>>,
    client: &reqwest::Client,
) -> anyhow::Result<Flow> {
    let mut upstreams: Vec<Arc<dyn Upstream>> = Vec::with_capacity(cfg.upstreams.len());

    for upstream_cfg in &cfg.upstreams {
        let name = if upstream_cfg.name.is_empty() {
            default_upstream_name(upstream_cfg)
        } else {
            upstream_cfg.name.clone()
        };

        let upstream = HttpUpstream::new(
            upstream_cfg,
            name,
            Arc::clone(trusted_proxies),
            client.clone(),
        )?;

        upstreams.push(Arc::new(upstream));
    }

    let aggregation = compile_aggregation(&cfg.aggregation, &upstreams)?;

    let mut plugins: Vec<Box<dyn PluginInstance>> = Vec::with_capacity(cfg.plugins.len());
    for plugin_cfg in &cfg.plugins {
        // Duplicate names within one flow are dropped, first wins.
        if plugins.iter().any(|p| p.name() == plugin_cfg.name) {
            continue;
        }

        let plugin = registry
            .get(&plugin_cfg.name)
            .ok_or_else(|| anyhow::anyhow!("unknown plugin '{}'", plugin_cfg.name))?;

        let instance = plugin.configure(&plugin_cfg.config)?;

        info!(plugin = %plugin_cfg.name, "plugin initialized");
        plugins.push(instance);
    }

    let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::with_capacity(cfg.middlewares.len());
    for middleware_cfg in &cfg.middlewares {
        if middlewares.iter().any(|m| m.name() == middleware_cfg.name) {
            continue;
        }

        let middleware = registry
            .build_middleware(&middleware_cfg.name, &middleware_cfg.config)
            .ok_or_else(|| anyhow::anyhow!("unknown middleware '{}'", middleware_cfg.name))??;

        info!(middleware = %middleware_cfg.name, "middleware initialized");
        middlewares.push(middleware);
    }

    Ok(Flow {
        path: cfg.path.clone(),
        method: cfg.method.clone(),
        aggregation,
        max_parallel_upstreams: cfg.max_parallel_upstreams.max(1) as usize,
        upstreams,
        plugins,
        middlewares,
        scripts: cfg.scripts.clone(),
    })
}

fn compile_aggregation(
    cfg: &AggregationConfig,
    upstreams: &[Arc<dyn Upstream>],
) -> anyhow::Result<Aggregation> {
    let mut aggregation = Aggregation::new(cfg.strategy, cfg.best_effort);

    // Conflict handling only applies to merge.
    if cfg.strategy != AggregationStrategy::Merge {
        return Ok(aggregation);
    }

    aggregation.conflict_policy = cfg.on_conflict.policy;

    if aggregation.conflict_policy == ConflictPolicy::Prefer {
        if cfg.on_conflict.upstream.is_empty() {
            anyhow::bail!("no upstream specified for on_conflict prefer policy");
        }

        let index = upstreams
            .iter()
            .position(|u| u.name() == cfg.on_conflict.upstream)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "preferred upstream '{}' for on_conflict policy does not exist",
                    cfg.on_conflict.upstream
                )
            })?;

        aggregation.preferred_upstream = Some(index);
    }

    Ok(aggregation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meld_core::config::{ConflictConfig, PolicyConfig, UpstreamConfig};
    use meld_observability::NopMetrics;

    fn upstream_cfg(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            hosts: vec!["http://127.0.0.1:9001".to_string()],
            path: "/v1".to_string(),
            method: "GET".to_string(),
            timeout_ms: 1_000,
            forward_headers: vec![],
            forward_queries: vec![],
            policy: PolicyConfig::default(),
        }
    }

    fn flow_cfg() -> FlowConfig {
        FlowConfig {
            path: "/orders".to_string(),
            method: "GET".to_string(),
            aggregation: AggregationConfig::default(),
            max_parallel_upstreams: 4,
            upstreams: vec![upstream_cfg("a"), upstream_cfg("b")],
            plugins: vec![],
            middlewares: vec![],
            scripts: vec![],
        }
    }

    fn config_with_flow(flow: FlowConfig) -> Config {
        Config {
            schema: "v1".to_string(),
            name: "test".to_string(),
            version: "0".to_string(),
            debug: false,
            server: Default::default(),
            rate_limiter: Default::default(),
            trusted_proxies: vec![],
            flows: vec![flow],
        }
    }

    #[tokio::test]
    async fn builds_router_from_valid_config() {
        let registry = PluginRegistry::new();
        let router = build_router(
            &config_with_flow(flow_cfg()),
            &registry,
            Arc::new(NopMetrics),
        )
        .unwrap();

        assert_eq!(router.flows().len(), 1);
        assert_eq!(router.flows()[0].upstreams.len(), 2);
    }

    #[tokio::test]
    async fn invalid_trusted_proxy_cidr_fails() {
        let mut config = config_with_flow(flow_cfg());
        config.trusted_proxies = vec!["10.0.0.0/99".to_string()];

        let registry = PluginRegistry::new();
        let err = build_router(&config, &registry, Arc::new(NopMetrics)).unwrap_err();
        assert!(err.to_string().contains("invalid CIDR"), "got: {err}");
    }

    #[tokio::test]
    async fn unknown_plugin_fails_compilation() {
        let mut flow = flow_cfg();
        flow.plugins.push(meld_core::config::PluginConfig {
            name: "nope".to_string(),
            config: serde_json::Value::Null,
        });

        let registry = PluginRegistry::new();
        let err = build_router(&config_with_flow(flow), &registry, Arc::new(NopMetrics))
            .unwrap_err();
        assert!(err.to_string().contains("unknown plugin"), "got: {err}");
    }

    #[tokio::test]
    async fn prefer_policy_resolves_upstream_index() {
        let mut flow = flow_cfg();
        flow.aggregation = AggregationConfig {
            strategy: AggregationStrategy::Merge,
            best_effort: false,
            on_conflict: ConflictConfig {
                policy: ConflictPolicy::Prefer,
                upstream: "b".to_string(),
            },
        };

        let registry = PluginRegistry::new();
        let router = build_router(&config_with_flow(flow), &registry, Arc::new(NopMetrics))
            .unwrap();

        assert_eq!(router.flows()[0].aggregation.preferred_upstream, Some(1));
    }

    #[tokio::test]
    async fn prefer_policy_with_missing_upstream_fails() {
        let mut flow = flow_cfg();
        flow.aggregation = AggregationConfig {
            strategy: AggregationStrategy::Merge,
            best_effort: false,
            on_conflict: ConflictConfig {
                policy: ConflictPolicy::Prefer,
                upstream: "ghost".to_string(),
            },
        };

        let registry = PluginRegistry::new();
        let err = build_router(&config_with_flow(flow), &registry, Arc::new(NopMetrics))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got: {err}");
    }

    #[tokio::test]
    async fn unnamed_upstream_gets_derived_name() {
        let mut flow = flow_cfg();
        flow.upstreams[0].name = String::new();

        let registry = PluginRegistry::new();
        let router = build_router(&config_with_flow(flow), &registry, Arc::new(NopMetrics))
            .unwrap();

        assert_eq!(
            router.flows()[0].upstreams[0].name(),
            "get-http://127.0.0.1:9001"
        );
    }

    fn bare_flow(path: &str, method: &str) -> Flow {
        Flow {
            path: path.to_string(),
            method: method.to_string(),
            aggregation: Aggregation::new(AggregationStrategy::Array, false),
            max_parallel_upstreams: 1,
            upstreams: vec![],
            plugins: vec![],
            middlewares: vec![],
            scripts: vec![],
        }
    }

    #[test]
    fn flow_matching_is_method_insensitive_and_path_exact() {
        let flow = bare_flow("/orders", "GET");

        assert!(flow.matches("get", "/orders"));
        assert!(flow.matches("GET", "/orders"));
        assert!(!flow.matches("POST", "/orders"));
        assert!(!flow.matches("GET", "/orders/"));
        assert!(!flow.matches("GET", "/other"));
    }

    // ── Property-based tests ─────────────────────────────────────

    proptest::proptest! {
        /// Matching must never panic regardless of method or path input.
        #[test]
        fn matching_never_panics_on_arbitrary_input(
            method in "[A-Za-z]{0,10}",
            path   in "(/[a-z0-9]{0,8}){0,4}",
        ) {
            let flow = bare_flow("/fixed/path", "GET");
            let _ = flow.matches(&method, &path);
        }

        /// A longer path never matches an exact-path flow.
        #[test]
        fn matching_rejects_path_extensions(suffix in "[a-z]{1,12}") {
            let flow = bare_flow("/fixed/path", "GET");
            let candidate = format!("/fixed/path/{suffix}");
            assert!(!flow.matches("GET", &candidate));
        }
    }
}
