use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use meld_plugin::{Plugin, PluginContext, PluginInfo, PluginInstance, PluginKind};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Request-phase plugin that sets static headers on the in-flight request
/// before dispatch, e.g. an internal auth token for upstreams.
pub struct HeaderInjectPlugin;

#[derive(Debug, Deserialize)]
struct HeaderInjectConfig {
    headers: HashMap<String, String>,
}

struct HeaderInjectInstance {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Plugin for HeaderInjectPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "header-inject".to_string(),
            description: "Sets configured static request headers".to_string(),
            version: "v1".to_string(),
        }
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Request
    }

    fn configure(&self, config: &Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: HeaderInjectConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("header-inject config error: {e}"))?;

        let mut headers = Vec::with_capacity(cfg.headers.len());
        for (name, value) in cfg.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| anyhow::anyhow!("header-inject: invalid header name '{name}': {e}"))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| anyhow::anyhow!("header-inject: invalid header value: {e}"))?;
            headers.push((name, value));
        }

        Ok(Box::new(HeaderInjectInstance { headers }))
    }
}

#[async_trait]
impl PluginInstance for HeaderInjectInstance {
    fn name(&self) -> &str {
        "header-inject"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Request
    }

    async fn execute(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
        for (name, value) in &self.headers {
            ctx.request.headers.insert(name.clone(), value.clone());
        }

        Ok(())
    }
}
