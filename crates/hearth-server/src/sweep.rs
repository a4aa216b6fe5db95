use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use hearth_ratelimit::RateLimiter;

/// Periodically drop rate-limit buckets whose whole window has passed, so
/// one-off clients do not accumulate for the life of the process.
pub async fn run(limiter: Arc<RateLimiter>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = limiter.sweep_idle();
        if removed > 0 {
            debug!(
                "Swept {} idle rate-limit buckets, {} remain",
                removed,
                limiter.bucket_count()
            );
        }
    }
}
