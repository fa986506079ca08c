//! Built-in plugins and middlewares.
//!
//! Everything here is compiled in and selected by name from flow config;
//! there is no dynamic loading.

pub mod header_inject;
pub mod request_id;
pub mod snakeify;

use std::sync::Arc;

use meld_plugin::{Middleware, PluginRegistry};

/// Register every built-in plugin and middleware.
pub fn register_all(registry: &mut PluginRegistry) {
    registry.register(Arc::new(snakeify::SnakeifyPlugin));
    registry.register(Arc::new(header_inject::HeaderInjectPlugin));

    registry.register_middleware("request-id", |config| {
        let middleware = request_id::RequestIdMiddleware::from_config(config)?;
        Ok(Arc::new(middleware) as Arc<dyn Middleware>)
    });
}
