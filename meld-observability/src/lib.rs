pub mod metrics;

pub use metrics::{FailReason, Metrics, NopMetrics, PrometheusMetrics};
