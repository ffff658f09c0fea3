//! Token bucket rate limiter per installation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<Uuid, TokenBucket>>>,
    max_tokens: u32,
    refill_rate: f64, // tokens per second
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens: requests_per_minute,
            refill_rate: requests_per_minute as f64 / 60.0,
        }
    }

    pub fn check(&self, installation_id: Uuid) -> bool {
        self.check_at(installation_id, Instant::now())
    }

    fn check_at(&self, installation_id: Uuid, now: Instant) -> bool {
        let Ok(mut buckets) = self.buckets.lock() else {
            return false;
        };

        let bucket = buckets.entry(installation_id).or_insert(TokenBucket {
            tokens: self.max_tokens as f64,
            last_refill: now,
        });

        // Refill tokens
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_drains_then_refills() {
        let limiter = RateLimiter::new(3);
        let id = Uuid::new_v4();
        let start = Instant::now();

        assert!(limiter.check_at(id, start));
        assert!(limiter.check_at(id, start));
        assert!(limiter.check_at(id, start));
        assert!(!limiter.check_at(id, start));

        // 3 per minute refills one token every 20s
        assert!(limiter.check_at(id, start + Duration::from_secs(20)));
        assert!(!limiter.check_at(id, start + Duration::from_secs(21)));
    }

    #[test]
    fn installations_have_separate_buckets() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        assert!(limiter.check_at(Uuid::new_v4(), start));
        assert!(limiter.check_at(Uuid::new_v4(), start));
    }
}
