use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::model::{EndpointDataReference, EndpointDataReferenceEntry};
use crate::query::QuerySpec;
use crate::store::{EdrStore, StoreError};
use crate::utils::time::{Clock, SystemClock};

/// How a resolve call treats an expiring cached credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshMode {
    /// Hand back whatever is cached, even if expired.
    NoRefresh,
    /// Refresh only when the cached credential has expired.
    AutoRefresh,
    /// Refresh unconditionally.
    ForceRefresh,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("token refresh failed: {0}")]
    Failed(String),
}

/// External collaborator that exchanges an expiring credential for a fresh
/// one. OAuth/DID mechanics live behind this boundary; retry policy, if any,
/// is the implementor's business.
#[async_trait]
pub trait TokenRefreshHandler: Send + Sync {
    async fn refresh_token(
        &self,
        transfer_process_id: &str,
        current: &EndpointDataReference,
    ) -> Result<EndpointDataReference, RefreshError>;
}

/// Service-level failure taxonomy; store failures map 1:1, never retried
/// here.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Fatal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::AlreadyLeased(msg) => ServiceError::Conflict(msg),
            StoreError::AlreadyExists(msg) => ServiceError::Conflict(msg),
            other => ServiceError::Fatal(other.to_string()),
        }
    }
}

/// Decides, per request, whether a cached credential can be handed out
/// as-is or must go through the refresh collaborator first.
pub struct EdrService {
    store: Arc<dyn EdrStore>,
    refresh_handler: Arc<dyn TokenRefreshHandler>,
    clock: Arc<dyn Clock>,
    /// Per-key serialization of the read-check-refresh-write sequence.
    /// Concurrent resolves of one expired key must agree on a single
    /// collaborator call; the store lease only fences the final save.
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EdrService {
    pub fn new(store: Arc<dyn EdrStore>, refresh_handler: Arc<dyn TokenRefreshHandler>) -> Self {
        Self::with_clock(store, refresh_handler, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn EdrStore>,
        refresh_handler: Arc<dyn TokenRefreshHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            refresh_handler,
            clock,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the credential for a transfer process, refreshing it first
    /// when the mode and its expiration state call for it.
    pub async fn resolve_by_transfer_process(
        &self,
        transfer_process_id: &str,
        mode: RefreshMode,
    ) -> Result<EndpointDataReference, ServiceError> {
        // pure read, never enters the refresh sequence
        if mode == RefreshMode::NoRefresh {
            return self
                .store
                .resolve_reference(transfer_process_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(transfer_process_id.to_string()));
        }

        // a second caller waits here and then re-reads, so it sees the
        // replacement instead of refreshing again
        let lock = self.refresh_lock(transfer_process_id);
        let _guard = lock.lock().await;

        let edr = self
            .store
            .resolve_reference(transfer_process_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(transfer_process_id.to_string()))?;

        let entry = self.store.find_by_transfer_process_id(transfer_process_id).await?;

        if is_expired(&edr, &entry, self.clock.millis()) || mode == RefreshMode::ForceRefresh {
            debug!(transfer_process_id, ?mode, "refreshing endpoint data reference");
            return self.refresh(transfer_process_id, &entry, &edr).await;
        }

        Ok(edr)
    }

    fn refresh_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.refresh_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Criterion query over cache entries, for API listings.
    pub async fn query(
        &self,
        spec: &QuerySpec,
    ) -> Result<Vec<EndpointDataReferenceEntry>, ServiceError> {
        Ok(self.store.query_for_entries(spec).await?)
    }

    /// Administrative removal of an entry and its credential.
    pub async fn delete_by_transfer_process(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, ServiceError> {
        Ok(self
            .store
            .delete_by_transfer_process_id(transfer_process_id)
            .await?)
    }

    async fn refresh(
        &self,
        transfer_process_id: &str,
        entry: &EndpointDataReferenceEntry,
        current: &EndpointDataReference,
    ) -> Result<EndpointDataReference, ServiceError> {
        let refreshed = self
            .refresh_handler
            .refresh_token(transfer_process_id, current)
            .await
            .map_err(|err| {
                warn!(transfer_process_id, error = %err, "token refresh failed");
                ServiceError::Fatal(err.to_string())
            })?;

        // immutability by replacement: a new entry carries the provenance of
        // the old one, the store stamps the rest
        let replacement = entry
            .with_same_identity()
            .build()
            .map_err(|err| ServiceError::Fatal(err.to_string()))?;

        self.store.save(&replacement, &refreshed).await?;
        info!(
            transfer_process_id,
            edr_id = %refreshed.id,
            "endpoint data reference refreshed"
        );
        Ok(refreshed)
    }
}

/// Expiry decision: `expiresIn` is seconds relative to the entry's
/// `created_at` millis, truncated to whole seconds. The boundary instant is
/// compared against millisecond "now" and is itself still valid; the
/// credential is expired strictly after it.
fn is_expired(
    edr: &EndpointDataReference,
    entry: &EndpointDataReferenceEntry,
    now_millis: i64,
) -> bool {
    match edr.expires_in() {
        Some(expires_in) => (entry.created_at / 1000 + expires_in) * 1000 < now_millis,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edr(expires_in: Option<i64>) -> EndpointDataReference {
        let builder = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://provider/data");
        match expires_in {
            Some(seconds) => builder.expires_in(seconds).build().unwrap(),
            None => builder.build().unwrap(),
        }
    }

    fn entry(created_at_millis: i64) -> EndpointDataReferenceEntry {
        EndpointDataReferenceEntry::builder()
            .transfer_process_id("tp1")
            .asset_id("a1")
            .agreement_id("ag1")
            .created_at(created_at_millis)
            .build()
            .unwrap()
    }

    #[test]
    fn no_expires_in_never_expires() {
        assert!(!is_expired(&edr(None), &entry(0), i64::MAX));
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        // created at t=1000s, 300s lifetime => expires strictly after 1300s
        let entry = entry(1_000_000);
        let edr = edr(Some(300));
        assert!(!is_expired(&edr, &entry, 1_299_999));
        assert!(!is_expired(&edr, &entry, 1_300_000));
        assert!(is_expired(&edr, &entry, 1_300_001));
    }

    #[test]
    fn created_at_millis_are_truncated() {
        // 1999 millis truncate to 1s, so expiry is at 1 + 10 = 11s
        let entry = entry(1_999);
        let edr = edr(Some(10));
        assert!(!is_expired(&edr, &entry, 11_000));
        assert!(is_expired(&edr, &entry, 11_001));
    }

    #[test]
    fn zero_lifetime_mid_second_creation_is_expired_at_once() {
        // truncation anchors the boundary at the start of the creation
        // second, so with a zero lifetime the credential is already past it
        // a few hundred millis later, within the same second
        let entry = entry(1_000_000_500);
        let edr = edr(Some(0));
        assert!(is_expired(&edr, &entry, 1_000_000_900));
        assert!(is_expired(&edr, &entry, 1_000_000_501));
    }
}
