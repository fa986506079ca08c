pub mod aggregator;
pub mod builder;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod rate_limit;
pub mod router;
pub mod script;
pub mod server;
pub mod upstream;

pub use builder::build_router;
pub use router::FlowRouter;
pub use server::Server;
