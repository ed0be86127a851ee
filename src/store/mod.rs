pub mod client;
pub mod pool;
pub mod scripts;

pub use client::RedisStore;

use async_trait::async_trait;

use crate::errors::Result;

/// Outcome of a scripted shared-store operation
#[derive(Debug, Clone, Copy)]
pub struct StoreDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at_ms: i64,
    pub retry_after_s: i64,
}

/// Atomic read-modify-write operations backing strong-mode engines.
///
/// Every admit executes indivisibly on the store side; quota variants are
/// read-only. Failures surface as `StoreUnavailable` and are never folded
/// into an allow or deny.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn token_bucket_admit(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        cost: i64,
        burst: i64,
    ) -> Result<StoreDecision>;

    async fn token_bucket_quota(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        burst: i64,
    ) -> Result<StoreDecision>;

    async fn sliding_window_admit(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        cost: i64,
    ) -> Result<StoreDecision>;

    async fn sliding_window_quota(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
    ) -> Result<StoreDecision>;

    async fn ping(&self) -> Result<()>;
}
