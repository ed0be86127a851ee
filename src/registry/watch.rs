use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, EventType, GetOptions, KeyValue, WatchOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{HeliosError, Result};
use crate::registry::{PolicySnapshot, TenantEntry, TenantRecord, TENANT_PREFIX};

/// Delay before re-establishing a broken watch
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Spawn the registry watcher: an initial prefix load, a watch for push
/// updates, and a periodic reconcile that doubles as the liveness probe the
/// staleness budget is measured against. The task re-establishes the watch
/// after failures; while it is down the snapshot ages and readiness flips.
pub fn spawn(client: Client, snapshot: Arc<PolicySnapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reconcile_every = (snapshot.staleness_budget() / 3).max(Duration::from_secs(1));

        loop {
            if let Err(e) = sync_and_watch(&client, &snapshot, reconcile_every).await {
                warn!(error = %e, "registry watch interrupted, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    })
}

async fn sync_and_watch(
    client: &Client,
    snapshot: &PolicySnapshot,
    reconcile_every: Duration,
) -> Result<()> {
    let revision = reload(client, snapshot).await?;
    info!(
        tenants = snapshot.len(),
        revision, "registry snapshot loaded"
    );

    let mut watch_client = client.watch_client();
    let (_watcher, mut stream) = watch_client
        .watch(
            TENANT_PREFIX,
            Some(
                WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(revision + 1),
            ),
        )
        .await?;

    let mut reconcile = tokio::time::interval_at(
        tokio::time::Instant::now() + reconcile_every,
        reconcile_every,
    );

    loop {
        tokio::select! {
            message = stream.message() => {
                let resp = message?.ok_or_else(|| {
                    HeliosError::RegistryUnavailable("watch stream closed".to_string())
                })?;

                if resp.canceled() {
                    return Err(HeliosError::RegistryUnavailable(
                        "watch canceled by server".to_string(),
                    ));
                }

                for event in resp.events() {
                    apply_event(snapshot, event.event_type(), event.kv());
                }
                snapshot.stamp_synced();
            }
            _ = reconcile.tick() => {
                reload(client, snapshot).await?;
                debug!(tenants = snapshot.len(), "registry snapshot reconciled");
            }
        }
    }
}

/// Full prefix load into the snapshot; returns the store revision the next
/// watch should start after.
async fn reload(client: &Client, snapshot: &PolicySnapshot) -> Result<i64> {
    let mut kv = client.kv_client();
    let resp = kv
        .get(TENANT_PREFIX, Some(GetOptions::new().with_prefix()))
        .await?;

    let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

    let mut entries = Vec::with_capacity(resp.kvs().len());
    for kvp in resp.kvs() {
        match parse_record(kvp) {
            Ok(record) => entries.push(TenantEntry {
                record: Arc::new(record),
                revision: kvp.mod_revision(),
            }),
            Err(e) => {
                warn!(
                    key = %String::from_utf8_lossy(kvp.key()),
                    error = %e,
                    "skipping invalid tenant record"
                );
            }
        }
    }

    snapshot.replace_all(entries);
    snapshot.stamp_synced();
    Ok(revision)
}

fn apply_event(snapshot: &PolicySnapshot, event_type: EventType, kvp: Option<&KeyValue>) {
    let Some(kvp) = kvp else { return };

    match event_type {
        EventType::Put => match parse_record(kvp) {
            Ok(record) => {
                debug!(tenant_id = %record.tenant_id, revision = kvp.mod_revision(), "tenant record updated");
                snapshot.apply_put(record, kvp.mod_revision());
            }
            Err(e) => {
                warn!(
                    key = %String::from_utf8_lossy(kvp.key()),
                    error = %e,
                    "ignoring invalid tenant record update"
                );
            }
        },
        EventType::Delete => {
            let key = String::from_utf8_lossy(kvp.key()).to_string();
            if let Some(tenant_id) = key.strip_prefix(TENANT_PREFIX) {
                debug!(tenant_id, "tenant record deleted");
                snapshot.apply_delete(tenant_id);
            }
        }
    }
}

fn parse_record(kvp: &KeyValue) -> Result<TenantRecord> {
    let record: TenantRecord = serde_json::from_slice(kvp.value())?;
    record.validate()?;
    Ok(record)
}
