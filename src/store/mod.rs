pub mod memory;
pub mod sql;

use async_trait::async_trait;
use thiserror::Error;

use crate::lease::LeaseError;
use crate::model::{EndpointDataReference, EndpointDataReferenceEntry};
use crate::query::{QueryError, QuerySpec};
use crate::vault::SecretStoreError;

/// Secret-store key prefix for credential payloads, `edr--{edr_id}`.
pub const VAULT_PREFIX: &str = "edr--";

/// Tagged failure taxonomy for store operations. Expected conditions are
/// values; only genuinely unexpected I/O ends up in `General`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    #[error("entry is leased by another owner: {0}")]
    AlreadyLeased(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("persistence failure: {0}")]
    General(String),
}

impl From<QueryError> for StoreError {
    fn from(err: QueryError) -> Self {
        StoreError::InvalidQuery(err.to_string())
    }
}

impl From<LeaseError> for StoreError {
    fn from(err: LeaseError) -> Self {
        StoreError::AlreadyLeased(err.to_string())
    }
}

impl From<SecretStoreError> for StoreError {
    fn from(err: SecretStoreError) -> Self {
        StoreError::General(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::General(format!("credential serialization failed: {err}"))
    }
}

/// Lease-protected, queryable record store for endpoint data references.
///
/// Two implementations exist, [`memory::InMemoryEdrStore`] and
/// [`sql::SqlEdrStore`], sharing this contract and one conformance test
/// suite; callers must not be able to tell them apart.
#[async_trait]
pub trait EdrStore: Send + Sync {
    /// Pure read, no lease involved.
    async fn resolve_reference(
        &self,
        transfer_process_id: &str,
    ) -> Result<Option<EndpointDataReference>, StoreError>;

    /// Entry lookup by key; `NotFound` when absent.
    async fn find_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError>;

    /// Credentials of every entry for one asset. Unordered.
    async fn references_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReference>, StoreError>;

    /// Entries for one asset. Unordered.
    async fn entries_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError>;

    /// Entries for one contract agreement. Unordered.
    async fn entries_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError>;

    /// Generic criterion query; unknown operands yield `InvalidQuery`.
    async fn query_for_entries(
        &self,
        spec: &QuerySpec,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError>;

    /// Upsert of the entry/credential pair.
    ///
    /// Serialized against leases on `entry.transfer_process_id`: an active
    /// lease held by a different owner rejects the save with `AlreadyLeased`.
    /// On success any prior pair for the key is replaced, `updated_at` is
    /// stamped and the key left unleased.
    async fn save(
        &self,
        entry: &EndpointDataReferenceEntry,
        edr: &EndpointDataReference,
    ) -> Result<(), StoreError>;

    /// Removes the entry and its credential as a pair, returning the removed
    /// entry. `NotFound` when absent, `AlreadyLeased` while another owner
    /// holds the key.
    async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError>;
}

/// Stamps store-managed fields on a saved entry: `created_at` when unset,
/// `updated_at` always, and the expiration derived from the credential's
/// `expiresIn` (seconds relative to `created_at`, truncating millis).
pub(crate) fn stamp_for_save(
    entry: &EndpointDataReferenceEntry,
    edr: &EndpointDataReference,
    now_millis: i64,
) -> EndpointDataReferenceEntry {
    let mut stored = entry.clone();
    if stored.created_at == 0 {
        stored.created_at = now_millis;
    }
    stored.updated_at = now_millis;
    stored.expiration_timestamp = edr
        .expires_in()
        .map(|seconds| stored.created_at / 1000 + seconds);
    stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_sets_timestamps_and_expiration() {
        let entry = EndpointDataReferenceEntry::builder()
            .transfer_process_id("tp1")
            .asset_id("a1")
            .agreement_id("ag1")
            .build()
            .unwrap();
        let edr = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://x")
            .expires_in(300)
            .build()
            .unwrap();

        let stamped = stamp_for_save(&entry, &edr, 1_700_000_000_500);
        assert_eq!(stamped.created_at, 1_700_000_000_500);
        assert_eq!(stamped.updated_at, 1_700_000_000_500);
        // truncating division of created_at millis
        assert_eq!(stamped.expiration_timestamp, Some(1_700_000_000 + 300));
    }

    #[test]
    fn stamp_preserves_existing_created_at() {
        let entry = EndpointDataReferenceEntry::builder()
            .transfer_process_id("tp1")
            .asset_id("a1")
            .agreement_id("ag1")
            .created_at(1_000_000)
            .build()
            .unwrap();
        let edr = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://x")
            .build()
            .unwrap();

        let stamped = stamp_for_save(&entry, &edr, 2_000_000);
        assert_eq!(stamped.created_at, 1_000_000);
        assert_eq!(stamped.updated_at, 2_000_000);
        assert_eq!(stamped.expiration_timestamp, None);
    }
}
