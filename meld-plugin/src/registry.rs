use std::collections::HashMap;
use std::sync::Arc;

use crate::middleware::Middleware;
use crate::plugin::Plugin;

type MiddlewareFactory =
    Box<dyn Fn(&serde_json::Value) -> anyhow::Result<Arc<dyn Middleware>> + Send + Sync>;

/// Compile-time registry of plugin and middleware factories, keyed by name.
///
/// Built once at startup, immutable thereafter. Flow compilation resolves
/// names from config into configured instances; an unknown name is a
/// startup error, never a runtime one.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    middlewares: HashMap<String, MiddlewareFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            middlewares: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.info().name;
        tracing::info!(plugin = %name, "registered plugin");
        self.plugins.insert(name, plugin);
    }

    pub fn register_middleware<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<Arc<dyn Middleware>> + Send + Sync + 'static,
    {
        tracing::info!(middleware = %name, "registered middleware");
        self.middlewares.insert(name.to_string(), Box::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// Build a configured middleware by name.
    pub fn build_middleware(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Option<anyhow::Result<Arc<dyn Middleware>>> {
        self.middlewares.get(name).map(|factory| factory(config))
    }

    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
