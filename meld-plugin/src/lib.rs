pub mod context;
pub mod middleware;
pub mod plugin;
pub mod registry;

pub use context::{PluginContext, RequestData, ResponseData};
pub use middleware::{Middleware, MiddlewareAction};
pub use plugin::{Plugin, PluginInfo, PluginInstance, PluginKind};
pub use registry::PluginRegistry;
