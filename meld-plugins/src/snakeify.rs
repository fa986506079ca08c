use async_trait::async_trait;
use bytes::Bytes;
use meld_plugin::{Plugin, PluginContext, PluginInfo, PluginInstance, PluginKind};
use regex::Regex;
use serde_json::Value;

/// Response-phase plugin that rewrites the top-level keys of a JSON object
/// body from camelCase to snake_case. Non-object bodies pass through
/// untouched.
pub struct SnakeifyPlugin;

struct SnakeifyInstance {
    boundary: Regex,
    acronym: Regex,
}

impl Plugin for SnakeifyPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "snakeify".to_string(),
            description: "Rewrites top-level response object keys to snake_case".to_string(),
            version: "v1".to_string(),
        }
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Response
    }

    fn configure(&self, _config: &Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        Ok(Box::new(SnakeifyInstance {
            acronym: Regex::new("(.)([A-Z][a-z]+)").expect("static pattern"),
            boundary: Regex::new("([a-z0-9])([A-Z])").expect("static pattern"),
        }))
    }
}

impl SnakeifyInstance {
    fn camel_to_snake(&self, s: &str) -> String {
        let s = self.acronym.replace_all(s, "${1}_${2}");
        let s = self.boundary.replace_all(&s, "${1}_${2}");
        s.to_lowercase()
    }
}

#[async_trait]
impl PluginInstance for SnakeifyInstance {
    fn name(&self) -> &str {
        "snakeify"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Response
    }

    async fn execute(&self, ctx: &mut PluginContext) -> anyhow::Result<()> {
        let Some(response) = ctx.response.as_mut() else {
            return Ok(());
        };
        let Some(body) = response.body.as_ref() else {
            return Ok(());
        };

        let parsed: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "snakeify: response body is not JSON, skipping");
                return Ok(());
            }
        };

        let Value::Object(map) = parsed else {
            return Ok(());
        };

        let rewritten: serde_json::Map<String, Value> = map
            .into_iter()
            .map(|(k, v)| (self.camel_to_snake(&k), v))
            .collect();

        response.body = Some(Bytes::from(serde_json::to_vec(&Value::Object(rewritten))?));

        Ok(())
    }
}
