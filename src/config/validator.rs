use crate::config::{Config, EtcdConfig, RedisConfig};
use crate::errors::{HeliosError, Result};
use tracing::{debug, warn};

/// Validate the entire process configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("Validating configuration...");

    validate_redis_config(&config.redis)?;
    validate_etcd_config(&config.etcd)?;

    if config.gateway.address.is_empty() {
        return Err(HeliosError::Configuration(
            "gateway address cannot be empty".to_string(),
        ));
    }

    if config.control.address.is_empty() {
        return Err(HeliosError::Configuration(
            "control address cannot be empty".to_string(),
        ));
    }

    debug!("Configuration validation successful");
    Ok(())
}

fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(HeliosError::Configuration(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(HeliosError::Configuration(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(HeliosError::Configuration(
            "Redis pool size must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "Redis pool size is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connect_timeout.is_zero() || config.command_timeout.is_zero() {
        return Err(HeliosError::Configuration(
            "Redis timeouts must be greater than 0".to_string(),
        ));
    }

    if config.ping_failure_threshold == 0 {
        return Err(HeliosError::Configuration(
            "store ping failure threshold must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_etcd_config(config: &EtcdConfig) -> Result<()> {
    if config.endpoints.is_empty() {
        return Err(HeliosError::Configuration(
            "at least one etcd endpoint is required".to_string(),
        ));
    }

    if config.staleness_budget.is_zero() {
        return Err(HeliosError::Configuration(
            "staleness budget must be greater than 0".to_string(),
        ));
    }

    Ok(())
}
