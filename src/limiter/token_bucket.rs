use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{HeliosError, Result};
use crate::limiter::{
    now_secs, AdmitContext, Decision, LimitConfig, Limiter, RETRY_AFTER_CAP_SECS,
};

/// Upper bound on decision keys a single engine tracks
const MAX_TRACKED_KEYS: usize = 65_536;

/// Idle entries are swept every this many operations
const SWEEP_EVERY_OPS: u64 = 256;

/// Node-local token bucket engine.
///
/// One mutex guards the whole key map; the critical section is a handful of
/// float operations. Keys idle for twice the window are lazily swept, and the
/// map is bounded with least-recently-used eviction.
pub struct TokenBucketLimiter {
    cfg: LimitConfig,
    capacity: usize,
    state: Mutex<BucketMap>,
}

struct BucketMap {
    buckets: HashMap<String, Bucket>,
    ops: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: f64,
    last_access: f64,
}

impl TokenBucketLimiter {
    pub fn new(cfg: LimitConfig) -> Self {
        Self::with_capacity(cfg, MAX_TRACKED_KEYS)
    }

    fn with_capacity(cfg: LimitConfig, capacity: usize) -> Self {
        Self {
            cfg,
            capacity,
            state: Mutex::new(BucketMap {
                buckets: HashMap::new(),
                ops: 0,
            }),
        }
    }

    /// Admit at an explicit timestamp (fractional unix seconds). The public
    /// async contract delegates here with the wall clock.
    pub fn admit_at(&self, key: &str, cost: i64, now: f64) -> Result<Decision> {
        if cost < 0 {
            return Err(HeliosError::InvalidRequest(format!(
                "cost must be non-negative, got {cost}"
            )));
        }

        let burst = self.cfg.burst as f64;
        let limit = self.cfg.limit as f64;
        let window = self.cfg.window.as_secs_f64();

        let mut map = self.state.lock();
        map.maintain(now, self.cfg, self.capacity, key);

        let bucket = map.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
            last_access: now,
        });

        // (elapsed * limit) / window, not elapsed * (limit / window): the
        // former is exact for whole-window refills.
        let elapsed = (now - bucket.last_refill).max(0.0);
        bucket.tokens = burst.min(bucket.tokens + elapsed * limit / window);
        bucket.last_refill = now;
        bucket.last_access = now;

        let cost_f = cost as f64;
        let allowed = cost == 0 || bucket.tokens >= cost_f;
        let mut retry_after_s = 0;
        if allowed {
            if cost > 0 {
                bucket.tokens -= cost_f;
            }
        } else {
            retry_after_s = ceil_secs((cost_f - bucket.tokens) * window / limit).max(1);
        }

        Ok(self.decision(allowed, bucket.tokens, retry_after_s, now))
    }

    /// Quota at an explicit timestamp: refill only, nothing charged.
    pub fn quota_at(&self, key: &str, now: f64) -> Result<Decision> {
        let burst = self.cfg.burst as f64;
        let limit = self.cfg.limit as f64;
        let window = self.cfg.window.as_secs_f64();

        let mut map = self.state.lock();
        map.maintain(now, self.cfg, self.capacity, key);

        let bucket = map.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
            last_access: now,
        });

        let elapsed = (now - bucket.last_refill).max(0.0);
        bucket.tokens = burst.min(bucket.tokens + elapsed * limit / window);
        bucket.last_refill = now;
        bucket.last_access = now;

        Ok(self.decision(true, bucket.tokens, 0, now))
    }

    fn decision(&self, allowed: bool, tokens: f64, retry_after_s: i64, now: f64) -> Decision {
        let burst = self.cfg.burst as f64;
        let limit = self.cfg.limit as f64;
        let window = self.cfg.window.as_secs_f64();
        let refill_in = ceil_secs((burst - tokens) * window / limit);

        Decision {
            allowed,
            remaining: tokens.floor() as i64,
            limit: self.cfg.limit,
            reset_at: now as i64 + refill_in,
            retry_after_s,
        }
    }
}

impl BucketMap {
    /// Bounded-memory upkeep: periodic idle sweep plus LRU eviction when a
    /// new key would overflow the map.
    fn maintain(&mut self, now: f64, cfg: LimitConfig, capacity: usize, incoming: &str) {
        self.ops += 1;
        if self.ops % SWEEP_EVERY_OPS == 0 {
            let idle_cutoff = now - 2.0 * cfg.window.as_secs_f64();
            self.buckets.retain(|_, b| b.last_access > idle_cutoff);
        }

        if self.buckets.len() >= capacity && !self.buckets.contains_key(incoming) {
            let lru = self
                .buckets
                .iter()
                .min_by(|a, b| a.1.last_access.total_cmp(&b.1.last_access))
                .map(|(k, _)| k.clone());
            if let Some(key) = lru {
                self.buckets.remove(&key);
            }
        }
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn admit(&self, ctx: &AdmitContext, key: &str, cost: i64) -> Result<Decision> {
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }
        self.admit_at(key, cost, now_secs())
    }

    async fn quota(&self, ctx: &AdmitContext, key: &str) -> Result<Decision> {
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }
        self.quota_at(key, now_secs())
    }

    fn tracked_keys(&self) -> Option<usize> {
        Some(self.state.lock().buckets.len())
    }
}

/// Ceil a seconds value into a whole-second count, capped so a degenerate
/// rate never reports a nonsensical horizon.
fn ceil_secs(secs: f64) -> i64 {
    if !secs.is_finite() {
        return RETRY_AFTER_CAP_SECS;
    }
    (secs.ceil() as i64).clamp(0, RETRY_AFTER_CAP_SECS)
}
