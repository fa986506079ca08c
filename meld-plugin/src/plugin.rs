use async_trait::async_trait;
use serde_json::Value;

use crate::context::PluginContext;

/// Which side of the upstream dispatch a plugin runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    /// Runs before dispatch; may rewrite the request.
    Request,
    /// Runs after aggregation; may rewrite the response.
    Response,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Request => "request",
            PluginKind::Response => "response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

/// A plugin factory. Registered once at startup; `configure` binds it to a
/// flow-level config block and returns the instance that actually runs.
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn kind(&self) -> PluginKind;

    /// Validate the config block and build a configured instance.
    fn configure(&self, config: &Value) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A plugin bound to one flow's configuration.
///
/// An error return aborts the request with an INTERNAL client error; the
/// error itself is logged, never serialized to the client.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind;

    async fn execute(&self, ctx: &mut PluginContext) -> anyhow::Result<()>;
}
