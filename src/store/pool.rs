use crate::config::RedisConfig;
use crate::errors::{HeliosError, Result};
use deadpool::managed::PoolConfig as DeadpoolPoolConfig;
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, Runtime};
use tracing::info;

/// Create a bounded Redis connection pool from configuration.
///
/// The pool dials lazily; a node whose store is down still starts and serves
/// fast-mode traffic, reporting strong-mode admits as degraded.
pub fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    let mut cfg = DeadpoolRedisConfig::from_url(config.url.clone());

    let mut pool_cfg = DeadpoolPoolConfig::new(config.max_connections);
    pool_cfg.timeouts.wait = Some(config.connect_timeout);
    pool_cfg.timeouts.create = Some(config.connect_timeout);
    cfg.pool = Some(pool_cfg);

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| HeliosError::Configuration(format!("Redis pool creation failed: {e}")))?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );

    Ok(pool)
}

/// Snapshot of pool usage for the health surface
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}

pub fn get_pool_stats(pool: &Pool) -> PoolStats {
    let status = pool.status();
    PoolStats {
        size: status.size,
        available: status.available,
        max_size: status.max_size,
    }
}
