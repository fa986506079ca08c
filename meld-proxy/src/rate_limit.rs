use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

const CLEANUP_EVERY: Duration = Duration::from_secs(10);

struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window admission counter keyed by client IP.
///
/// One mutex guards the bucket map; the janitor task takes the same lock
/// every 10 seconds to evict expired windows.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,

    started: AtomicBool,
    stop: CancellationToken,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    /// Start the janitor. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let buckets = Arc::clone(&self.buckets);
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_EVERY);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => Self::evict_expired(&buckets),
                    _ = stop.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    /// Stop the janitor. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Admit or deny one request for the given key.
    pub fn allow(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let now = Instant::now();

        match buckets.get_mut(key) {
            Some(bucket) if now <= bucket.reset_at => {
                if bucket.count < self.limit {
                    bucket.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    fn evict_expired(buckets: &Mutex<HashMap<String, Bucket>>) {
        let now = Instant::now();
        let mut buckets = buckets.lock().expect("rate limiter lock");
        buckets.retain(|_, bucket| now <= bucket.reset_at);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock").len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
