use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{HeliosError, Result};
use crate::limiter::{now_secs, AdmitContext, Decision, LimitConfig, Limiter};

const MAX_TRACKED_KEYS: usize = 65_536;
const SWEEP_EVERY_OPS: u64 = 256;

/// Node-local sliding window engine.
///
/// Exact at the window boundary but O(events) per admit; offered for
/// billing-grade accounting rather than peak throughput.
pub struct SlidingWindowLimiter {
    cfg: LimitConfig,
    capacity: usize,
    state: Mutex<WindowMap>,
}

struct WindowMap {
    windows: HashMap<String, WindowState>,
    ops: u64,
}

struct WindowState {
    /// Event timestamps still inside the window, one entry per unit of cost
    events: Vec<f64>,
    last_access: f64,
}

impl SlidingWindowLimiter {
    pub fn new(cfg: LimitConfig) -> Self {
        Self::with_capacity(cfg, MAX_TRACKED_KEYS)
    }

    fn with_capacity(cfg: LimitConfig, capacity: usize) -> Self {
        Self {
            cfg,
            capacity,
            state: Mutex::new(WindowMap {
                windows: HashMap::new(),
                ops: 0,
            }),
        }
    }

    /// Admit at an explicit timestamp (fractional unix seconds)
    pub fn admit_at(&self, key: &str, cost: i64, now: f64) -> Result<Decision> {
        if cost < 0 {
            return Err(HeliosError::InvalidRequest(format!(
                "cost must be non-negative, got {cost}"
            )));
        }

        let limit = self.cfg.limit;
        let window = self.cfg.window.as_secs_f64();
        let window_start = now - window;

        let mut map = self.state.lock();
        map.maintain(now, self.cfg, self.capacity, key);

        let state = map.windows.entry(key.to_string()).or_insert(WindowState {
            events: Vec::new(),
            last_access: now,
        });
        state.last_access = now;

        // Entries at exactly now - window have aged out.
        state.events.retain(|&t| t > window_start);

        let current = state.events.len() as i64;
        if current + cost <= limit {
            for _ in 0..cost {
                state.events.push(now);
            }

            return Ok(Decision {
                allowed: true,
                remaining: limit - current - cost,
                limit,
                reset_at: (now + window) as i64,
                retry_after_s: 0,
            });
        }

        let reset_at = state
            .events
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
            .min(now)
            + window;

        Ok(Decision {
            allowed: false,
            remaining: (limit - current).max(0),
            limit,
            reset_at: reset_at as i64,
            retry_after_s: ((reset_at - now).ceil() as i64).max(1),
        })
    }

    /// Quota at an explicit timestamp: purge and report, nothing recorded.
    pub fn quota_at(&self, key: &str, now: f64) -> Result<Decision> {
        let limit = self.cfg.limit;
        let window = self.cfg.window.as_secs_f64();
        let window_start = now - window;

        let mut map = self.state.lock();
        map.maintain(now, self.cfg, self.capacity, key);

        let state = map.windows.entry(key.to_string()).or_insert(WindowState {
            events: Vec::new(),
            last_access: now,
        });
        state.last_access = now;
        state.events.retain(|&t| t > window_start);

        let current = state.events.len() as i64;

        Ok(Decision {
            allowed: true,
            remaining: (limit - current).max(0),
            limit,
            reset_at: (now + window) as i64,
            retry_after_s: 0,
        })
    }
}

impl WindowMap {
    fn maintain(&mut self, now: f64, cfg: LimitConfig, capacity: usize, incoming: &str) {
        self.ops += 1;
        if self.ops % SWEEP_EVERY_OPS == 0 {
            let idle_cutoff = now - 2.0 * cfg.window.as_secs_f64();
            self.windows.retain(|_, w| w.last_access > idle_cutoff);
        }

        if self.windows.len() >= capacity && !self.windows.contains_key(incoming) {
            let lru = self
                .windows
                .iter()
                .min_by(|a, b| a.1.last_access.total_cmp(&b.1.last_access))
                .map(|(k, _)| k.clone());
            if let Some(key) = lru {
                self.windows.remove(&key);
            }
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
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
        Some(self.state.lock().windows.len())
    }
}
