use bytes::Bytes;
use http::HeaderMap;

use crate::context::PluginContext;

/// Outcome of a middleware's request-side hook.
#[derive(Debug)]
pub enum MiddlewareAction {
    /// Continue to the next middleware / the core handler.
    Continue,

    /// Stop processing and respond immediately.
    ShortCircuit {
        status: u16,
        headers: HeaderMap,
        body: Option<Bytes>,
    },
}

/// A flow-scoped wrapper around the core handler.
///
/// Middlewares compose so that index 0 is outermost: `before` hooks run in
/// declaration order, `after` hooks in reverse. A short-circuit from
/// `before` skips the core handler and every later middleware, but the
/// `after` hooks of middlewares already entered still run.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, ctx: &mut PluginContext) -> MiddlewareAction {
        let _ = ctx;
        MiddlewareAction::Continue
    }

    fn after(&self, ctx: &mut PluginContext) {
        let _ = ctx;
    }
}
