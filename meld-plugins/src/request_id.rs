use http::header::HeaderValue;
use meld_plugin::{Middleware, MiddlewareAction, PluginContext};
use serde::Deserialize;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Middleware that guarantees a request id on the way in and mirrors it
/// onto the response on the way out, even when a later middleware
/// short-circuits before the core handler assigns one.
pub struct RequestIdMiddleware {
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RequestIdConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RequestIdMiddleware {
    pub fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
        let cfg: RequestIdConfig = if config.is_null() {
            RequestIdConfig {
                enabled: default_enabled(),
            }
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| anyhow::anyhow!("request-id config error: {e}"))?
        };

        Ok(Self {
            enabled: cfg.enabled,
        })
    }
}

impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request-id"
    }

    fn before(&self, ctx: &mut PluginContext) -> MiddlewareAction {
        if !self.enabled {
            return MiddlewareAction::Continue;
        }

        let existing = ctx
            .request
            .header(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let id = existing.unwrap_or_else(new_request_id);

        if let Ok(value) = HeaderValue::try_from(id.as_str()) {
            ctx.request.headers.insert(REQUEST_ID_HEADER, value);
        }
        ctx.request_id = id;

        MiddlewareAction::Continue
    }

    fn after(&self, ctx: &mut PluginContext) {
        if !self.enabled || ctx.request_id.is_empty() {
            return;
        }

        if let Some(response) = ctx.response.as_mut() {
            if let Ok(value) = HeaderValue::try_from(ctx.request_id.as_str()) {
                response.headers.insert(REQUEST_ID_HEADER, value);
            }
        }
    }
}

fn new_request_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}
