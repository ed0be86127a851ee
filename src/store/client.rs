use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;
use crate::errors::{HeliosError, Result};
use crate::store::{scripts, SharedStore, StoreDecision};

/// Shared-store client: pooled connections plus the scripted atomic
/// operations both algorithms run against Redis.
pub struct RedisStore {
    pool: Pool,
    command_timeout: Duration,
    ping_failures: AtomicU32,
    ping_failure_threshold: u32,
    seq: AtomicU64,
}

impl RedisStore {
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            command_timeout: config.command_timeout,
            ping_failures: AtomicU32::new(0),
            ping_failure_threshold: config.ping_failure_threshold,
            seq: AtomicU64::new(0),
        }
    }

    /// Best-effort startup warm-up: ping and preload the script cache.
    /// A failure is logged, not fatal; strong-mode admits will degrade until
    /// the store comes back.
    pub async fn warm_up(&self) {
        match self.load_scripts().await {
            Ok(()) => info!("Shared store reachable, scripts loaded"),
            Err(e) => warn!(
                "Shared store unreachable at startup ({}); strong-mode admits will be degraded",
                e
            ),
        }
    }

    async fn load_scripts(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| HeliosError::StoreUnavailable(format!("connection pool: {e}")))?;

        for script in scripts::all() {
            script
                .prepare_invoke()
                .load_async(&mut *conn)
                .await
                .map_err(|e| {
                    HeliosError::StoreUnavailable(format!("failed to load script: {e}"))
                })?;
        }
        debug!("Shared-store scripts loaded");
        Ok(())
    }

    /// Consecutive ping failures stayed under the configured threshold
    pub fn healthy(&self) -> bool {
        self.ping_failures.load(Ordering::Relaxed) < self.ping_failure_threshold
    }

    pub fn pool_stats(&self) -> crate::store::pool::PoolStats {
        crate::store::pool::get_pool_stats(&self.pool)
    }

    fn next_seq(&self) -> String {
        format!(
            "{}-{}",
            std::process::id(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn invoke(&self, script: &Script, key: &str, args: Vec<String>) -> Result<StoreDecision> {
        let mut conn = self.pool.get().await.map_err(|e| {
            crate::metrics::record_store_error();
            HeliosError::StoreUnavailable(format!("connection pool: {e}"))
        })?;

        let call = async {
            let values: Vec<redis::Value> = script
                .key(key)
                .arg(&args)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| HeliosError::StoreUnavailable(format!("script execution: {e}")))?;
            parse_decision(&values)
        };

        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => {
                if result.is_err() {
                    crate::metrics::record_store_error();
                }
                result
            }
            Err(_) => {
                crate::metrics::record_store_error();
                Err(HeliosError::StoreUnavailable(format!(
                    "command timed out after {:?}",
                    self.command_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn token_bucket_admit(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        cost: i64,
        burst: i64,
    ) -> Result<StoreDecision> {
        let args = vec![
            now_ms().to_string(),
            limit.to_string(),
            window_secs.to_string(),
            cost.to_string(),
            burst.to_string(),
        ];
        self.invoke(&scripts::TOKEN_BUCKET_ADMIT, key, args).await
    }

    async fn token_bucket_quota(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        burst: i64,
    ) -> Result<StoreDecision> {
        let args = vec![
            now_ms().to_string(),
            limit.to_string(),
            window_secs.to_string(),
            burst.to_string(),
        ];
        self.invoke(&scripts::TOKEN_BUCKET_QUOTA, key, args).await
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
        cost: i64,
    ) -> Result<StoreDecision> {
        let args = vec![
            now_ms().to_string(),
            limit.to_string(),
            window_secs.to_string(),
            cost.to_string(),
            self.next_seq(),
        ];
        self.invoke(&scripts::SLIDING_WINDOW_ADMIT, key, args).await
    }

    async fn sliding_window_quota(
        &self,
        key: &str,
        limit: i64,
        window_secs: i64,
    ) -> Result<StoreDecision> {
        let args = vec![
            now_ms().to_string(),
            limit.to_string(),
            window_secs.to_string(),
        ];
        self.invoke(&scripts::SLIDING_WINDOW_QUOTA, key, args).await
    }

    async fn ping(&self) -> Result<()> {
        let outcome = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| HeliosError::StoreUnavailable(format!("connection pool: {e}")))?;

            let response: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(HeliosError::from)?;

            if response != "PONG" {
                return Err(HeliosError::StoreUnavailable(format!(
                    "unexpected PING response: {response}"
                )));
            }
            Ok(())
        };

        let result = match tokio::time::timeout(self.command_timeout, outcome).await {
            Ok(result) => result,
            Err(_) => Err(HeliosError::StoreUnavailable("ping timed out".to_string())),
        };

        match &result {
            Ok(()) => {
                self.ping_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(failures, "shared store ping failed: {e}");
            }
        }

        result
    }
}

fn parse_decision(values: &[redis::Value]) -> Result<StoreDecision> {
    if values.len() != 4 {
        return Err(HeliosError::Internal(format!(
            "invalid script response length: {}",
            values.len()
        )));
    }

    Ok(StoreDecision {
        allowed: parse_int(&values[0])? == 1,
        remaining: parse_int(&values[1])?,
        reset_at_ms: parse_int(&values[2])?,
        retry_after_s: parse_int(&values[3])?,
    })
}

fn parse_int(value: &redis::Value) -> Result<i64> {
    match value {
        redis::Value::Int(v) => Ok(*v),
        other => Err(HeliosError::Internal(format!(
            "unexpected script reply type: {other:?}"
        ))),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision() {
        let values = vec![
            redis::Value::Int(1),
            redis::Value::Int(42),
            redis::Value::Int(1_700_000_000_000),
            redis::Value::Int(0),
        ];
        let decision = parse_decision(&values).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 42);
        assert_eq!(decision.reset_at_ms, 1_700_000_000_000);
        assert_eq!(decision.retry_after_s, 0);
    }

    #[test]
    fn test_parse_decision_denied() {
        let values = vec![
            redis::Value::Int(0),
            redis::Value::Int(0),
            redis::Value::Int(1_700_000_012_000),
            redis::Value::Int(12),
        ];
        let decision = parse_decision(&values).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_s, 12);
    }

    #[test]
    fn test_parse_decision_wrong_shape() {
        assert!(parse_decision(&[redis::Value::Int(1)]).is_err());

        let values = vec![
            redis::Value::Int(1),
            redis::Value::SimpleString("oops".into()),
            redis::Value::Int(0),
            redis::Value::Int(0),
        ];
        assert!(parse_decision(&values).is_err());
    }
}
