//! Per-`(session, tool)` token buckets.

use std::collections::HashMap;
use std::time::Instant;

use cf_domain::config::RateLimitConfig;
use parking_lot::RwLock;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by `(session_id, tool_name)`.
///
/// Buckets refill continuously at `refill_per_sec` up to `capacity`.
/// State only mutates under the turn that invokes the tool; sessions are
/// single-threaded, so the lock is uncontended in practice.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token for `(session_id, tool_name)`. Returns `false` when
    /// the bucket is exhausted.
    pub fn try_acquire(&self, session_id: &str, tool_name: &str) -> bool {
        let key = (session_id.to_owned(), tool_name.to_owned());
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key).or_insert_with(|| Bucket {
            tokens: self.config.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have fully refilled (idle sessions).
    pub fn prune(&self) {
        let capacity = self.config.capacity as f64;
        let refill = self.config.refill_per_sec;
        let now = Instant::now();
        self.buckets.write().retain(|_, bucket| {
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens + elapsed * refill < capacity
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_sec,
        })
    }

    #[test]
    fn burst_up_to_capacity_then_denied() {
        let rl = limiter(3, 0.0);
        assert!(rl.try_acquire("s", "t"));
        assert!(rl.try_acquire("s", "t"));
        assert!(rl.try_acquire("s", "t"));
        assert!(!rl.try_acquire("s", "t"));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let rl = limiter(1, 0.0);
        assert!(rl.try_acquire("s1", "t"));
        assert!(!rl.try_acquire("s1", "t"));
        // Different session, fresh bucket.
        assert!(rl.try_acquire("s2", "t"));
        // Same session, different tool, fresh bucket.
        assert!(rl.try_acquire("s1", "other"));
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = limiter(1, 1000.0);
        assert!(rl.try_acquire("s", "t"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(rl.try_acquire("s", "t"));
    }
}
