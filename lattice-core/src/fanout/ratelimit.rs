//! Per-target leaky-bucket rate limiting. One limiter instance per target is
//! shared by every worker in the process, so the configured rate holds
//! globally rather than per worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::outbox::FanoutTarget;

/// Leaky bucket expressed as minimum spacing between grants.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(per_sec: f64) -> Self {
        let interval = if per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / per_sec)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Compute the wait for this grant and push the next slot forward.
    /// The lock is released before sleeping.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait = {
            let mut next_free = self.next_free.lock().expect("rate limiter lock poisoned");
            let now = Instant::now();
            let wait = next_free.saturating_duration_since(now);
            *next_free = now.max(*next_free) + self.interval;
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Default)]
pub struct TargetRateLimiters {
    limiters: HashMap<FanoutTarget, Arc<RateLimiter>>,
}

impl TargetRateLimiters {
    pub fn from_config(rate_limits: &[(String, f64)]) -> Self {
        let mut limiters = HashMap::new();
        for (name, per_sec) in rate_limits {
            if let Some(target) = FanoutTarget::parse(name)
                && *per_sec > 0.0
            {
                limiters.insert(target, Arc::new(RateLimiter::new(*per_sec)));
            }
        }
        Self { limiters }
    }

    pub async fn acquire(&self, target: FanoutTarget) {
        if let Some(limiter) = self.limiters.get(&target) {
            limiter.acquire().await;
        }
    }

    pub fn configured(&self) -> Vec<FanoutTarget> {
        self.limiters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_spaces_grants() {
        let limiter = RateLimiter::new(100.0); // 10ms spacing
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two spaced grants after the initial free one.
        assert!(start.elapsed() >= Duration::from_millis(18));
    }

    #[tokio::test]
    async fn unconfigured_target_is_unthrottled() {
        let limiters = TargetRateLimiters::from_config(&[("vector".to_string(), 50.0)]);
        let start = Instant::now();
        for _ in 0..10 {
            limiters.acquire(FanoutTarget::Raw).await;
        }
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
