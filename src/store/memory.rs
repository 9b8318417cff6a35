use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::lease::{InMemoryLeaseManager, LeaseManager, DEFAULT_LEASE_DURATION};
use crate::model::{EndpointDataReference, EndpointDataReferenceEntry};
use crate::query::QuerySpec;
use crate::utils::time::{Clock, SystemClock};

use super::{stamp_for_save, EdrStore, StoreError};

struct State {
    entries: HashMap<String, EndpointDataReferenceEntry>,
    edrs: HashMap<String, EndpointDataReference>,
}

/// Thread-safe in-memory implementation of the cache.
///
/// Mutations go through the composed lease manager under the store's own
/// lock id, so behavior under contention matches the SQL-backed variant.
pub struct InMemoryEdrStore {
    state: Mutex<State>,
    leases: Arc<InMemoryLeaseManager>,
    lock_id: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryEdrStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let leases = Arc::new(InMemoryLeaseManager::new(clock.clone()));
        Self::with_lease_manager(clock, leases, DEFAULT_LEASE_DURATION)
    }

    /// Wires an externally shared lease manager, letting other writers
    /// contend with this store on the same keys.
    pub fn with_lease_manager(
        clock: Arc<dyn Clock>,
        leases: Arc<InMemoryLeaseManager>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                edrs: HashMap::new(),
            }),
            leases,
            lock_id: Uuid::new_v4().to_string(),
            lease_duration,
            clock,
        }
    }

    pub fn lease_manager(&self) -> Arc<InMemoryLeaseManager> {
        self.leases.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryEdrStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EdrStore for InMemoryEdrStore {
    async fn resolve_reference(
        &self,
        transfer_process_id: &str,
    ) -> Result<Option<EndpointDataReference>, StoreError> {
        Ok(self.lock().edrs.get(transfer_process_id).cloned())
    }

    async fn find_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError> {
        self.lock()
            .entries
            .get(transfer_process_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(transfer_process_id.to_string()))
    }

    async fn references_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReference>, StoreError> {
        let state = self.lock();
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.asset_id == asset_id)
            .filter_map(|entry| state.edrs.get(&entry.transfer_process_id).cloned())
            .collect())
    }

    async fn entries_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        Ok(self
            .lock()
            .entries
            .values()
            .filter(|entry| entry.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn entries_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        Ok(self
            .lock()
            .entries
            .values()
            .filter(|entry| entry.agreement_id == agreement_id)
            .cloned()
            .collect())
    }

    async fn query_for_entries(
        &self,
        spec: &QuerySpec,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        let entries: Vec<_> = self.lock().entries.values().cloned().collect();
        Ok(spec.evaluate(entries)?)
    }

    async fn save(
        &self,
        entry: &EndpointDataReferenceEntry,
        edr: &EndpointDataReference,
    ) -> Result<(), StoreError> {
        let key = entry.transfer_process_id.clone();
        self.leases.acquire(&key, &self.lock_id, self.lease_duration)?;

        let stored = stamp_for_save(entry, edr, self.clock.millis());
        {
            let mut state = self.lock();
            state.entries.insert(key.clone(), stored);
            state.edrs.insert(key.clone(), edr.clone());
        }
        debug!(transfer_process_id = %key, edr_id = %edr.id, "saved edr entry");

        self.leases.release(&key, &self.lock_id)?;
        Ok(())
    }

    async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError> {
        self.leases
            .acquire(transfer_process_id, &self.lock_id, self.lease_duration)?;

        let removed = {
            let mut state = self.lock();
            let entry = state.entries.remove(transfer_process_id);
            state.edrs.remove(transfer_process_id);
            entry
        };

        self.leases.release(transfer_process_id, &self.lock_id)?;

        match removed {
            Some(entry) => {
                debug!(transfer_process_id, "deleted edr entry");
                Ok(entry)
            }
            None => Err(StoreError::NotFound(transfer_process_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointDataReference, EndpointDataReferenceEntry};

    fn entry(tp: &str, asset: &str) -> EndpointDataReferenceEntry {
        EndpointDataReferenceEntry::builder()
            .transfer_process_id(tp)
            .asset_id(asset)
            .agreement_id("ag1")
            .build()
            .unwrap()
    }

    fn edr(id: &str) -> EndpointDataReference {
        EndpointDataReference::builder()
            .id(id)
            .endpoint("http://provider/data")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn save_stamps_timestamps() {
        let store = InMemoryEdrStore::new();
        store.save(&entry("tp1", "a1"), &edr("edr1")).await.unwrap();

        let stored = store.find_by_transfer_process_id("tp1").await.unwrap();
        assert!(stored.created_at > 0);
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[tokio::test]
    async fn save_rejected_while_foreign_lease_active() {
        let store = InMemoryEdrStore::new();
        store
            .lease_manager()
            .acquire("tp1", "someone-else", DEFAULT_LEASE_DURATION)
            .unwrap();

        let denied = store.save(&entry("tp1", "a1"), &edr("edr1")).await;
        assert!(matches!(denied, Err(StoreError::AlreadyLeased(_))));

        // an unrelated key is unaffected
        store.save(&entry("tp2", "a1"), &edr("edr2")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_rejected_while_foreign_lease_active() {
        let store = InMemoryEdrStore::new();
        store.save(&entry("tp1", "a1"), &edr("edr1")).await.unwrap();
        store
            .lease_manager()
            .acquire("tp1", "someone-else", DEFAULT_LEASE_DURATION)
            .unwrap();

        let denied = store.delete_by_transfer_process_id("tp1").await;
        assert!(matches!(denied, Err(StoreError::AlreadyLeased(_))));
    }
}
