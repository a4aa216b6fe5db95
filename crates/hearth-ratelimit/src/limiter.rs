use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{Limit, RateLimitConfig, actions};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    /// Over the limit; the oldest retained request leaves the window in
    /// `retry_after_secs` (never less than 1).
    Rejected { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    action: String,
    identifier: String,
}

type Bucket = VecDeque<Instant>;

pub struct RateLimiter {
    config: RateLimitConfig,
    fallback: Limit,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let fallback = config
            .limits
            .get(actions::DEFAULT)
            .copied()
            .unwrap_or(Limit::new(100, 60));
        Self {
            config,
            fallback,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The limit applied to `action`; unknown actions get the catch-all.
    pub fn limit_for(&self, action: &str) -> Limit {
        self.config
            .limits
            .get(action)
            .copied()
            .unwrap_or(self.fallback)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BucketKey, Bucket>> {
        // No panics happen while the lock is held; a poisoned table is still consistent.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn check(&self, action: &str, identifier: &str) -> Decision {
        self.check_at(action, identifier, Instant::now())
    }

    /// Admit or reject one request at `now`, recording it when admitted.
    pub fn check_at(&self, action: &str, identifier: &str, now: Instant) -> Decision {
        if !self.config.enabled {
            return Decision::Admitted;
        }

        let limit = self.limit_for(action);
        let key = BucketKey {
            action: action.to_string(),
            identifier: identifier.to_string(),
        };

        let mut buckets = self.lock();
        let bucket = buckets.entry(key).or_default();
        prune(bucket, now, limit.window);

        if bucket.len() >= limit.max_requests as usize {
            let retry_after_secs = retry_after(bucket, now, limit.window);
            drop(buckets);
            warn!(
                "Rate limit exceeded for {} on '{}', retry in {}s",
                identifier, action, retry_after_secs
            );
            return Decision::Rejected { retry_after_secs };
        }

        bucket.push_back(now);
        Decision::Admitted
    }

    pub fn remaining(&self, action: &str, identifier: &str) -> u32 {
        self.remaining_at(action, identifier, Instant::now())
    }

    /// Requests still available to `identifier` for `action` in the current window.
    pub fn remaining_at(&self, action: &str, identifier: &str, now: Instant) -> u32 {
        let limit = self.limit_for(action);
        let key = BucketKey {
            action: action.to_string(),
            identifier: identifier.to_string(),
        };

        let mut buckets = self.lock();
        let used = match buckets.get_mut(&key) {
            Some(bucket) => {
                prune(bucket, now, limit.window);
                bucket.len()
            }
            None => 0,
        };

        limit.max_requests.saturating_sub(used as u32)
    }

    /// Clear one action's bucket for `identifier`, or every bucket it owns
    /// when `action` is `None`.
    pub fn reset(&self, identifier: &str, action: Option<&str>) {
        let mut buckets = self.lock();
        match action {
            Some(action) => {
                buckets.remove(&BucketKey {
                    action: action.to_string(),
                    identifier: identifier.to_string(),
                });
            }
            None => buckets.retain(|key, _| key.identifier != identifier),
        }
        debug!("Rate limits reset for {}", identifier);
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    /// Drop buckets whose every entry has aged out of its window.
    /// Returns how many were removed.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|key, bucket| {
            let window = self
                .config
                .limits
                .get(&key.action)
                .map_or(self.fallback.window, |l| l.window);
            prune(bucket, now, window);
            !bucket.is_empty()
        });
        before - buckets.len()
    }

    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Number of live buckets; exposed for the sweep loop's logging.
    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }
}

fn prune(bucket: &mut Bucket, now: Instant, window: Duration) {
    bucket.retain(|ts| now.saturating_duration_since(*ts) < window);
}

fn retry_after(bucket: &Bucket, now: Instant, window: Duration) -> u64 {
    let wait = match bucket.iter().min() {
        Some(oldest) => window.saturating_sub(now.saturating_duration_since(*oldest)),
        None => window,
    };
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
