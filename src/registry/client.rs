use std::time::Duration;

use chrono::Utc;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use tracing::{debug, info, warn};

use crate::config::EtcdConfig;
use crate::errors::{HeliosError, Result};
use crate::registry::{tenant_key, TenantPatch, TenantRecord, TENANT_PREFIX};

/// Per-operation deadline against the coordination store
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Authoritative registry CRUD, backed by etcd.
///
/// Every write lands under `/helios/tenants/<tenant_id>` as JSON; decision
/// nodes pick the change up through the prefix watch.
pub struct PolicyRegistry {
    client: Client,
}

impl PolicyRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to the coordination store using process configuration
    pub async fn connect(config: &EtcdConfig) -> Result<Client> {
        let mut options =
            etcd_client::ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options)).await?;
        info!("Connected to etcd at {}", config.endpoints.join(","));
        Ok(client)
    }

    /// Create a tenant; rejects an existing `tenant_id` atomically.
    pub async fn create(&self, mut record: TenantRecord) -> Result<TenantRecord> {
        record.apply_defaults();
        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        record.validate()?;

        let key = tenant_key(&record.tenant_id);
        let payload = serde_json::to_vec(&record)?;

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key, payload, None)]);

        let mut kv = self.client.kv_client();
        let resp = with_timeout(kv.txn(txn)).await?;
        if !resp.succeeded() {
            return Err(HeliosError::TenantExists(record.tenant_id));
        }

        debug!(tenant_id = %record.tenant_id, "tenant created");
        Ok(record)
    }

    pub async fn get(&self, tenant_id: &str) -> Result<TenantRecord> {
        let mut kv = self.client.kv_client();
        let resp = with_timeout(kv.get(tenant_key(tenant_id), None)).await?;

        match resp.kvs().first() {
            Some(kvp) => Ok(serde_json::from_slice(kvp.value())?),
            None => Err(HeliosError::TenantNotFound(tenant_id.to_string())),
        }
    }

    /// Apply non-empty patch fields on top of the stored record
    pub async fn update(&self, tenant_id: &str, patch: TenantPatch) -> Result<TenantRecord> {
        let mut record = self.get(tenant_id).await?;
        record.apply_patch(patch, Utc::now());
        record.validate()?;

        let payload = serde_json::to_vec(&record)?;
        let mut kv = self.client.kv_client();
        with_timeout(kv.put(tenant_key(tenant_id), payload, None)).await?;

        debug!(tenant_id, "tenant updated");
        Ok(record)
    }

    /// Idempotent delete
    pub async fn delete(&self, tenant_id: &str) -> Result<()> {
        let mut kv = self.client.kv_client();
        with_timeout(kv.delete(tenant_key(tenant_id), None)).await?;
        debug!(tenant_id, "tenant deleted");
        Ok(())
    }

    /// All records, skipping any that no longer pass invariant checks
    pub async fn list(&self) -> Result<Vec<TenantRecord>> {
        let mut kv = self.client.kv_client();
        let resp = with_timeout(kv.get(TENANT_PREFIX, Some(GetOptions::new().with_prefix())))
            .await?;

        let mut records = Vec::with_capacity(resp.kvs().len());
        for kvp in resp.kvs() {
            let parsed: std::result::Result<TenantRecord, _> =
                serde_json::from_slice(kvp.value());
            match parsed {
                Ok(record) => match record.validate() {
                    Ok(()) => records.push(record),
                    Err(e) => {
                        warn!(
                            key = %String::from_utf8_lossy(kvp.key()),
                            error = %e,
                            "skipping tenant record failing invariants"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(kvp.key()),
                        error = %e,
                        "skipping unparseable tenant record"
                    );
                }
            }
        }

        Ok(records)
    }

    /// Liveness probe for the health surface
    pub async fn health(&self) -> Result<()> {
        let mut kv = self.client.kv_client();
        with_timeout(kv.get(
            TENANT_PREFIX,
            Some(GetOptions::new().with_prefix().with_count_only()),
        ))
        .await?;
        Ok(())
    }
}

async fn with_timeout<T, F>(call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, etcd_client::Error>>,
{
    match tokio::time::timeout(OP_TIMEOUT, call).await {
        Ok(result) => result.map_err(HeliosError::from),
        Err(_) => Err(HeliosError::RegistryUnavailable(format!(
            "operation timed out after {OP_TIMEOUT:?}"
        ))),
    }
}
