use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use meld_observability::Metrics;
use meld_plugin::RequestData;

use crate::builder::Flow;
use crate::upstream::{Upstream, UpstreamError, UpstreamErrorKind, UpstreamResponse};

/// Fans one request out across a flow's upstreams.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Returns one response per upstream, in upstream-declaration order,
    /// regardless of completion order. Never short-circuits on failure:
    /// the aggregator needs every outcome.
    async fn dispatch(
        &self,
        flow: &Flow,
        original: Arc<RequestData>,
        cancel: &CancellationToken,
    ) -> Vec<UpstreamResponse>;
}

pub struct DefaultDispatcher {
    metrics: Arc<dyn Metrics>,
}

impl DefaultDispatcher {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn dispatch(
        &self,
        flow: &Flow,
        original: Arc<RequestData>,
        cancel: &CancellationToken,
    ) -> Vec<UpstreamResponse> {
        let semaphore = Arc::new(Semaphore::new(flow.max_parallel_upstreams));
        let mut tasks = JoinSet::new();

        for (slot, upstream) in flow.upstreams.iter().enumerate() {
            let upstream = Arc::clone(upstream);
            let semaphore = Arc::clone(&semaphore);
            let original = Arc::clone(&original);
            let cancel = cancel.clone();
            let metrics = Arc::clone(&self.metrics);

            tasks.spawn(async move {
                // A closed semaphore is impossible here; treat it as cancellation.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            slot,
                            UpstreamResponse::from_error(UpstreamError::new(
                                UpstreamErrorKind::Canceled,
                                "dispatch semaphore closed",
                            )),
                        )
                    }
                };

                let start = Instant::now();
                let response = upstream.call(&cancel, &original).await;
                metrics.observe_upstream_latency(upstream.name(), start.elapsed().as_secs_f64());

                (slot, response)
            });
        }

        let mut results: Vec<Option<UpstreamResponse>> =
            (0..flow.upstreams.len()).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, response)) => results[slot] = Some(response),
                Err(err) => {
                    // A panicked upstream task must not take the whole flow down.
                    error!(error = %err, "upstream task failed to join");
                }
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    UpstreamResponse::from_error(UpstreamError::new(
                        UpstreamErrorKind::Internal,
                        "upstream task panicked",
                    ))
                })
            })
            .collect()
    }
}
