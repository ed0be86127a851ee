use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;

use crate::registry::TenantRecord;

/// One tenant as seen by a decision node. The revision is the coordination
/// store's mod revision and doubles as the engine-cache invalidation token.
#[derive(Clone)]
pub struct TenantEntry {
    pub record: Arc<TenantRecord>,
    pub revision: i64,
}

/// Locally cached view of the policy registry.
///
/// Admit-path lookups are lock-free loads of an atomically swapped table;
/// the watcher is the only writer. The snapshot also tracks when it last
/// heard from the coordination store so readiness can enforce the staleness
/// budget.
pub struct PolicySnapshot {
    table: ArcSwap<HashMap<String, TenantEntry>>,
    /// Unix seconds of the last successful sync; 0 = never synced
    last_sync: AtomicI64,
    staleness_budget: Duration,
}

impl PolicySnapshot {
    pub fn new(staleness_budget: Duration) -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
            last_sync: AtomicI64::new(0),
            staleness_budget,
        }
    }

    pub fn lookup(&self, tenant_id: &str) -> Option<TenantEntry> {
        self.table.load().get(tenant_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Insert or replace one tenant (watch Put event)
    pub fn apply_put(&self, record: TenantRecord, revision: i64) {
        let entry = TenantEntry {
            record: Arc::new(record),
            revision,
        };
        self.table.rcu(|table| {
            let mut next = HashMap::clone(table);
            next.insert(entry.record.tenant_id.clone(), entry.clone());
            next
        });
    }

    /// Remove one tenant (watch Delete event)
    pub fn apply_delete(&self, tenant_id: &str) {
        self.table.rcu(|table| {
            let mut next = HashMap::clone(table);
            next.remove(tenant_id);
            next
        });
    }

    /// Swap in a complete table (initial load and periodic reconcile)
    pub fn replace_all(&self, entries: Vec<TenantEntry>) {
        let mut table = HashMap::with_capacity(entries.len());
        for entry in entries {
            table.insert(entry.record.tenant_id.clone(), entry);
        }
        self.table.store(Arc::new(table));
    }

    /// Record that the coordination store was heard from just now
    pub fn stamp_synced(&self) {
        let now = unix_now();
        self.last_sync.store(now, Ordering::Relaxed);
        crate::metrics::record_registry_sync(now);
    }

    /// Whether the snapshot is within the staleness budget
    pub fn is_fresh(&self) -> bool {
        let last = self.last_sync.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        unix_now() - last <= self.staleness_budget.as_secs() as i64
    }

    pub fn staleness_budget(&self) -> Duration {
        self.staleness_budget
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
