pub mod client;
pub mod snapshot;
pub mod watch;

pub use client::PolicyRegistry;
pub use snapshot::{PolicySnapshot, TenantEntry};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{HeliosError, Result};
use crate::limiter::{Algorithm, LimitConfig, Mode};

/// Prefix under which tenant records are persisted in the coordination store
pub const TENANT_PREFIX: &str = "/helios/tenants/";

pub fn tenant_key(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}")
}

/// Tenant identifiers are opaque but bounded: 1-64 chars of `[A-Za-z0-9_-]`
pub fn valid_tenant_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Numeric limits for one resource. Algorithm and mode may be set per
/// resource; unset fields fall back to the record-level selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitPolicy {
    pub limit: i64,
    pub window_secs: u64,
    pub burst: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

impl LimitPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.limit <= 0 {
            return Err(HeliosError::InvalidRequest(format!(
                "limit must be positive, got {}",
                self.limit
            )));
        }
        if self.window_secs == 0 {
            return Err(HeliosError::InvalidRequest(
                "window must be positive".to_string(),
            ));
        }
        if self.burst < self.limit {
            return Err(HeliosError::InvalidRequest(format!(
                "burst ({}) must be at least the limit ({})",
                self.burst, self.limit
            )));
        }
        Ok(())
    }

    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig::new(
            self.limit,
            Duration::from_secs(self.window_secs),
            self.burst,
        )
    }
}

/// Policy handed out by the registry when a tenant carries none
pub fn default_policy() -> LimitPolicy {
    LimitPolicy {
        limit: 100,
        window_secs: 60,
        burst: 120,
        algorithm: None,
        mode: None,
    }
}

/// Authoritative per-tenant configuration, stored as JSON under
/// `/helios/tenants/<tenant_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,

    /// Permitted API keys; order preserved as written
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// resource -> limits; the "default" entry backs unknown resources
    #[serde(default)]
    pub limits: HashMap<String, LimitPolicy>,

    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    /// Fill registry defaults on create
    pub fn apply_defaults(&mut self) {
        if self.limits.is_empty() {
            self.limits
                .insert("default".to_string(), default_policy());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !valid_tenant_id(&self.tenant_id) {
            return Err(HeliosError::InvalidRequest(format!(
                "invalid tenant id: {:?}",
                self.tenant_id
            )));
        }
        for (resource, policy) in &self.limits {
            policy.validate().map_err(|e| {
                HeliosError::InvalidRequest(format!("resource {resource:?}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn permits_key(&self, api_key: &str) -> bool {
        self.api_keys.iter().any(|k| k == api_key)
    }

    /// Resolve the effective policy for a resource: the resource's own entry,
    /// else the tenant's "default" entry, else the registry default.
    pub fn policy_for(&self, resource: &str) -> ResolvedPolicy {
        let policy = self
            .limits
            .get(resource)
            .or_else(|| self.limits.get("default"))
            .cloned()
            .unwrap_or_else(default_policy);

        ResolvedPolicy {
            limits: policy.limit_config(),
            algorithm: policy.algorithm.unwrap_or(self.algorithm),
            mode: policy.mode.unwrap_or(self.mode),
        }
    }

    /// Merge non-empty patch fields and bump `updated_at`
    pub fn apply_patch(&mut self, patch: TenantPatch, now: DateTime<Utc>) {
        if let Some(limits) = patch.limits {
            self.limits = limits;
        }
        if let Some(api_keys) = patch.api_keys {
            self.api_keys = api_keys;
        }
        if let Some(algorithm) = patch.algorithm {
            self.algorithm = algorithm;
        }
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        self.updated_at = now;
    }
}

/// Partial update accepted by the control plane; absent fields stay intact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantPatch {
    #[serde(default)]
    pub limits: Option<HashMap<String, LimitPolicy>>,
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// Fully resolved policy the manager builds engines from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPolicy {
    pub limits: LimitConfig,
    pub algorithm: Algorithm,
    pub mode: Mode,
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TenantRecord {
        let mut record = TenantRecord {
            tenant_id: "acme".to_string(),
            api_keys: vec!["key-1".to_string(), "key-2".to_string()],
            limits: HashMap::new(),
            algorithm: Algorithm::TokenBucket,
            mode: Mode::Fast,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        record.apply_defaults();
        record
    }

    #[test]
    fn test_tenant_id_pattern() {
        assert!(valid_tenant_id("acme"));
        assert!(valid_tenant_id("Tenant_01-prod"));
        assert!(valid_tenant_id(&"a".repeat(64)));

        assert!(!valid_tenant_id(""));
        assert!(!valid_tenant_id(&"a".repeat(65)));
        assert!(!valid_tenant_id("bad tenant"));
        assert!(!valid_tenant_id("tenant/../../etc"));
    }

    #[test]
    fn test_defaults_fill_default_resource() {
        let record = record();
        let resolved = record.policy_for("anything");
        assert_eq!(resolved.limits.limit, 100);
        assert_eq!(resolved.limits.burst, 120);
        assert_eq!(resolved.limits.window, Duration::from_secs(60));
        assert_eq!(resolved.algorithm, Algorithm::TokenBucket);
        assert_eq!(resolved.mode, Mode::Fast);
    }

    #[test]
    fn test_policy_resolution_prefers_resource_entry() {
        let mut record = record();
        record.limits.insert(
            "search".to_string(),
            LimitPolicy {
                limit: 10,
                window_secs: 1,
                burst: 20,
                algorithm: Some(Algorithm::SlidingWindow),
                mode: Some(Mode::Strong),
            },
        );

        let resolved = record.policy_for("search");
        assert_eq!(resolved.limits.limit, 10);
        assert_eq!(resolved.algorithm, Algorithm::SlidingWindow);
        assert_eq!(resolved.mode, Mode::Strong);

        // Unknown resources still resolve through "default".
        let resolved = record.policy_for("upload");
        assert_eq!(resolved.limits.limit, 100);
        assert_eq!(resolved.algorithm, Algorithm::TokenBucket);
    }

    #[test]
    fn test_invariants_rejected() {
        let bad = LimitPolicy {
            limit: 0,
            window_secs: 60,
            burst: 100,
            algorithm: None,
            mode: None,
        };
        assert!(bad.validate().is_err());

        let bad = LimitPolicy {
            limit: 100,
            window_secs: 0,
            burst: 100,
            algorithm: None,
            mode: None,
        };
        assert!(bad.validate().is_err());

        let bad = LimitPolicy {
            limit: 100,
            window_secs: 60,
            burst: 50,
            algorithm: None,
            mode: None,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_patch_merges_only_present_fields() {
        let mut record = record();
        let before_created = record.created_at;
        let now = Utc::now();

        record.apply_patch(
            TenantPatch {
                api_keys: Some(vec!["rotated".to_string()]),
                mode: Some(Mode::Strong),
                ..Default::default()
            },
            now,
        );

        assert_eq!(record.api_keys, vec!["rotated"]);
        assert_eq!(record.mode, Mode::Strong);
        assert_eq!(record.algorithm, Algorithm::TokenBucket);
        assert!(record.limits.contains_key("default"));
        assert_eq!(record.created_at, before_created);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: TenantRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.tenant_id, "acme");
        assert_eq!(parsed.api_keys.len(), 2);
        assert!(parsed.limits.contains_key("default"));
    }

    #[test]
    fn test_permits_key() {
        let record = record();
        assert!(record.permits_key("key-1"));
        assert!(!record.permits_key("key-3"));
    }
}
