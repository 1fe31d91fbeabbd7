//! Token bucket limiter for form submissions, keyed by visitor address.

use crate::settings::RateLimitSettings;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant, interval: Duration, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed / interval.as_secs_f64()).min(burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant, interval: Duration, burst: f64) -> bool {
        self.refill(now, interval, burst);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct SubmissionLimiter {
    interval: Duration,
    burst: f64,
    idle_expiry: Duration,
    buckets: RwLock<HashMap<IpAddr, TokenBucket>>,
}

impl SubmissionLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            interval: settings.interval(),
            burst: settings.burst.max(1) as f64,
            idle_expiry: settings.idle_expiry(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true when a submission from `ip` may proceed.
    pub async fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.burst, now));

        let allowed = bucket.try_consume(now, self.interval, self.burst);
        if !allowed {
            log::info!("Submission rate limit hit for {ip}");
        }
        allowed
    }

    /// Drop buckets not touched within the idle expiry.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    async fn cleanup_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < self.idle_expiry);
        let removed = before - buckets.len();
        if removed > 0 {
            log::debug!("Expired {removed} idle rate limit buckets");
        }
        removed
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.read().await.len()
    }
}
