pub mod manager;
pub mod shared;
pub mod sliding_window;
pub mod token_bucket;

pub use manager::LimiterManager;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::Result;

/// Cap reported when the computed retry horizon is degenerate
pub const RETRY_AFTER_CAP_SECS: i64 = 365 * 86_400;

/// Rate limiting algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
        }
    }
}

/// Consistency mode: node-local state or atomic shared-store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Fast,
    Strong,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Strong => "strong",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Mode::Fast),
            "strong" => Ok(Mode::Strong),
            other => Err(format!("unknown consistency mode: {other}")),
        }
    }
}

/// Effective numeric limits an engine enforces.
///
/// Values are normalized on construction: a non-positive limit falls back to
/// 100 per minute and burst is raised to at least the limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitConfig {
    pub limit: i64,
    pub burst: i64,
    pub window: Duration,
}

impl LimitConfig {
    pub fn new(limit: i64, window: Duration, burst: i64) -> Self {
        let limit = if limit > 0 { limit } else { 100 };
        let window = if window.is_zero() {
            Duration::from_secs(60)
        } else {
            window
        };
        let burst = burst.max(limit);
        Self {
            limit,
            burst,
            window,
        }
    }

    /// Refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window.as_secs_f64()
    }

    pub fn window_secs(&self) -> i64 {
        self.window.as_secs().max(1) as i64
    }
}

/// Outcome of an admit or quota call
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    /// Unix seconds at which the budget is fully restored (token bucket) or
    /// the window ends (sliding window)
    pub reset_at: i64,
    /// Positive only when denied
    pub retry_after_s: i64,
}

/// Request-scoped context carried into every admit.
///
/// The deadline derives from the caller's request timeout; an admit that
/// finds it already expired returns `Cancelled` without touching state.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitContext {
    pub deadline: Option<Instant>,
}

impl AdmitContext {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

/// Uniform contract over all engine variants.
///
/// Admits to the same decision key are serialized per engine; different keys
/// never share state.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide allow/deny and charge `cost` against the key's budget
    async fn admit(&self, ctx: &AdmitContext, key: &str, cost: i64) -> Result<Decision>;

    /// Read the current budget without charging
    async fn quota(&self, ctx: &AdmitContext, key: &str) -> Result<Decision>;

    /// Number of decision keys currently tracked, when the engine holds
    /// local state
    fn tracked_keys(&self) -> Option<usize> {
        None
    }
}

/// Wall-clock now as fractional unix seconds
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
