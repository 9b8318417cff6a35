//! Conformance suite shared by the in-memory and SQL-backed stores: both
//! must be indistinguishable through the `EdrStore` contract.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

use edr_cache::lease::{LeaseError, LeaseManager};
use edr_cache::model::{EndpointDataReference, EndpointDataReferenceEntry};
use edr_cache::query::{Criterion, QuerySpec, SortOrder};
use edr_cache::store::memory::InMemoryEdrStore;
use edr_cache::store::sql::SqlEdrStore;
use edr_cache::store::{EdrStore, StoreError};
use edr_cache::utils::time::Clock;
use edr_cache::vault::InMemorySecretStore;

struct TestClock(AtomicI64);

impl TestClock {
    fn starting_at(millis: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(millis)))
    }

    fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn memory_store(clock: Arc<TestClock>) -> InMemoryEdrStore {
    InMemoryEdrStore::with_clock(clock)
}

fn sql_store(clock: Arc<TestClock>) -> SqlEdrStore {
    let conn = Connection::open_in_memory().expect("open sqlite");
    SqlEdrStore::with_clock(conn, Arc::new(InMemorySecretStore::new()), clock).expect("init schema")
}

fn entry(tp: &str, asset: &str, agreement: &str) -> EndpointDataReferenceEntry {
    EndpointDataReferenceEntry::builder()
        .transfer_process_id(tp)
        .asset_id(asset)
        .agreement_id(agreement)
        .provider_id(Some("provider-1".to_string()))
        .build()
        .unwrap()
}

fn edr(id: &str) -> EndpointDataReference {
    EndpointDataReference::builder()
        .id(id)
        .endpoint("http://provider/data")
        .auth_key("Authorization")
        .auth_code(format!("token-for-{id}"))
        .expires_in(300)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// round-trip
// ---------------------------------------------------------------------------

async fn assert_round_trip(store: &dyn EdrStore) -> Result<()> {
    store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;

    let resolved = store.resolve_reference("tp1").await?.expect("credential present");
    assert_eq!(resolved.id, "edr1");
    assert_eq!(resolved.endpoint, "http://provider/data");
    assert_eq!(resolved.auth_code.as_deref(), Some("token-for-edr1"));
    assert_eq!(resolved.expires_in(), Some(300));

    let stored = store.find_by_transfer_process_id("tp1").await?;
    assert_eq!(stored.asset_id, "a1");
    assert!(stored.created_at > 0);
    assert_eq!(
        stored.expiration_timestamp,
        Some(stored.created_at / 1000 + 300)
    );

    assert_eq!(store.resolve_reference("missing").await?, None);
    Ok(())
}

#[tokio::test]
async fn round_trip_memory() -> Result<()> {
    assert_round_trip(&memory_store(TestClock::starting_at(1_000_000))).await
}

#[tokio::test]
async fn round_trip_sql() -> Result<()> {
    assert_round_trip(&sql_store(TestClock::starting_at(1_000_000))).await
}

// ---------------------------------------------------------------------------
// upsert replaces the pair
// ---------------------------------------------------------------------------

async fn assert_upsert_replaces(store: &dyn EdrStore) -> Result<()> {
    store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;
    store.save(&entry("tp1", "a1-new", "ag1"), &edr("edr2")).await?;

    let resolved = store.resolve_reference("tp1").await?.expect("credential present");
    assert_eq!(resolved.id, "edr2");

    let stored = store.find_by_transfer_process_id("tp1").await?;
    assert_eq!(stored.asset_id, "a1-new");

    // the old pair is fully gone
    assert!(store.entries_for_asset("a1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn upsert_replaces_memory() -> Result<()> {
    assert_upsert_replaces(&memory_store(TestClock::starting_at(1_000_000))).await
}

#[tokio::test]
async fn upsert_replaces_sql() -> Result<()> {
    assert_upsert_replaces(&sql_store(TestClock::starting_at(1_000_000))).await
}

// ---------------------------------------------------------------------------
// lease mutual exclusion
// ---------------------------------------------------------------------------

async fn assert_lease_mutual_exclusion(
    store: &dyn EdrStore,
    leases: &dyn LeaseManager,
    clock: &TestClock,
) -> Result<()> {
    store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;

    leases.acquire("tp1", "owner-a", Duration::from_millis(5_000))?;
    assert!(leases.is_leased("tp1"));

    let denied = leases.acquire("tp1", "owner-b", Duration::from_millis(5_000));
    assert!(matches!(denied, Err(LeaseError::AlreadyLeased { .. })));

    // a save by the store itself is a different owner and must conflict
    let conflicted = store.save(&entry("tp1", "a1", "ag1"), &edr("edr2")).await;
    assert!(matches!(conflicted, Err(StoreError::AlreadyLeased(_))));

    // after the lease duration elapses the key is free for anyone
    clock.advance(5_001);
    assert!(!leases.is_leased("tp1"));
    leases.acquire("tp1", "owner-b", Duration::from_millis(5_000))?;
    leases.release("tp1", "owner-b")?;

    store.save(&entry("tp1", "a1", "ag1"), &edr("edr2")).await?;
    Ok(())
}

#[tokio::test]
async fn lease_mutual_exclusion_memory() -> Result<()> {
    let clock = TestClock::starting_at(1_000_000);
    let store = memory_store(clock.clone());
    let leases = store.lease_manager();
    assert_lease_mutual_exclusion(&store, leases.as_ref(), &clock).await
}

#[tokio::test]
async fn lease_mutual_exclusion_sql() -> Result<()> {
    let clock = TestClock::starting_at(1_000_000);
    let store = sql_store(clock.clone());
    let leases = store.lease_manager();
    assert_lease_mutual_exclusion(&store, &leases, &clock).await
}

// ---------------------------------------------------------------------------
// deletion removes both projections
// ---------------------------------------------------------------------------

async fn assert_delete_removes_projections(store: &dyn EdrStore) -> Result<()> {
    store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;
    store.save(&entry("tp2", "a1", "ag2"), &edr("edr2")).await?;

    let removed = store.delete_by_transfer_process_id("tp1").await?;
    assert_eq!(removed.transfer_process_id, "tp1");
    assert_eq!(removed.asset_id, "a1");

    assert_eq!(store.resolve_reference("tp1").await?, None);

    let remaining_refs = store.references_for_asset("a1").await?;
    assert_eq!(remaining_refs.len(), 1);
    assert_eq!(remaining_refs[0].id, "edr2");

    let all = store.query_for_entries(&QuerySpec::max()).await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].transfer_process_id, "tp2");

    let missing = store.delete_by_transfer_process_id("tp1").await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn delete_removes_projections_memory() -> Result<()> {
    assert_delete_removes_projections(&memory_store(TestClock::starting_at(1_000_000))).await
}

#[tokio::test]
async fn delete_removes_projections_sql() -> Result<()> {
    assert_delete_removes_projections(&sql_store(TestClock::starting_at(1_000_000))).await
}

// ---------------------------------------------------------------------------
// projections by asset and agreement
// ---------------------------------------------------------------------------

async fn assert_projections(store: &dyn EdrStore) -> Result<()> {
    store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;
    store.save(&entry("tp2", "a1", "ag2"), &edr("edr2")).await?;
    store.save(&entry("tp3", "a2", "ag1"), &edr("edr3")).await?;

    let mut for_asset: Vec<String> = store
        .entries_for_asset("a1")
        .await?
        .into_iter()
        .map(|e| e.transfer_process_id)
        .collect();
    for_asset.sort();
    assert_eq!(for_asset, vec!["tp1", "tp2"]);

    let mut for_agreement: Vec<String> = store
        .entries_for_agreement("ag1")
        .await?
        .into_iter()
        .map(|e| e.transfer_process_id)
        .collect();
    for_agreement.sort();
    assert_eq!(for_agreement, vec!["tp1", "tp3"]);

    let mut refs: Vec<String> = store
        .references_for_asset("a1")
        .await?
        .into_iter()
        .map(|r| r.id)
        .collect();
    refs.sort();
    assert_eq!(refs, vec!["edr1", "edr2"]);

    assert!(store.entries_for_asset("nope").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn projections_memory() -> Result<()> {
    assert_projections(&memory_store(TestClock::starting_at(1_000_000))).await
}

#[tokio::test]
async fn projections_sql() -> Result<()> {
    assert_projections(&sql_store(TestClock::starting_at(1_000_000))).await
}

// ---------------------------------------------------------------------------
// criterion queries behave identically on both evaluators
// ---------------------------------------------------------------------------

async fn seed_for_queries(store: &dyn EdrStore) -> Result<()> {
    for i in 1..=5 {
        store
            .save(
                &entry(&format!("tp{i}"), &format!("asset-{i}"), "ag1"),
                &edr(&format!("edr{i}")),
            )
            .await?;
    }
    Ok(())
}

async fn query_ids(store: &dyn EdrStore, spec: &QuerySpec) -> Result<Vec<String>> {
    let mut ids: Vec<String> = store
        .query_for_entries(spec)
        .await?
        .into_iter()
        .map(|e| e.transfer_process_id)
        .collect();
    ids.sort();
    Ok(ids)
}

#[tokio::test]
async fn criterion_queries_agree_across_implementations() -> Result<()> {
    let memory = memory_store(TestClock::starting_at(1_000_000));
    let sql = sql_store(TestClock::starting_at(1_000_000));
    seed_for_queries(&memory).await?;
    seed_for_queries(&sql).await?;

    let specs = vec![
        QuerySpec::max().with_filter(Criterion::eq("assetId", "asset-3")),
        QuerySpec::max().with_filter(Criterion::not_eq("assetId", "asset-3")),
        QuerySpec::max().with_filter(Criterion::is_in(
            "transferProcessId",
            vec!["tp1".to_string(), "tp4".to_string()],
        )),
        QuerySpec::max().with_filter(Criterion::eq("agreementId", "ag1")),
        QuerySpec::max().with_filter(Criterion::eq("assetId", "no-such-asset")),
        QuerySpec::max().with_filter(Criterion::eq("state", "0")),
        QuerySpec::max()
            .with_filter(Criterion::eq("agreementId", "ag1"))
            .with_filter(Criterion::eq("assetId", "asset-2")),
    ];

    for spec in &specs {
        let from_memory = query_ids(&memory, spec).await?;
        let from_sql = query_ids(&sql, spec).await?;
        assert_eq!(from_memory, from_sql, "diverged for spec {spec:?}");
    }

    // spot-check one result set against expectations
    let filtered = query_ids(
        &memory,
        &QuerySpec::max().with_filter(Criterion::eq("assetId", "asset-3")),
    )
    .await?;
    assert_eq!(filtered, vec!["tp3"]);
    Ok(())
}

#[tokio::test]
async fn sorted_paged_queries_agree_across_implementations() -> Result<()> {
    let memory = memory_store(TestClock::starting_at(1_000_000));
    let sql = sql_store(TestClock::starting_at(1_000_000));
    seed_for_queries(&memory).await?;
    seed_for_queries(&sql).await?;

    let spec = QuerySpec {
        limit: 2,
        offset: 1,
        ..QuerySpec::default()
    }
    .sorted_by("transferProcessId", SortOrder::Desc);

    let from_memory: Vec<String> = memory
        .query_for_entries(&spec)
        .await?
        .into_iter()
        .map(|e| e.transfer_process_id)
        .collect();
    let from_sql: Vec<String> = sql
        .query_for_entries(&spec)
        .await?
        .into_iter()
        .map(|e| e.transfer_process_id)
        .collect();

    assert_eq!(from_memory, vec!["tp4", "tp3"]);
    assert_eq!(from_memory, from_sql);
    Ok(())
}

#[tokio::test]
async fn sql_store_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("edr.sqlite");
    let secrets = Arc::new(InMemorySecretStore::new());
    let clock = TestClock::starting_at(1_000_000);

    {
        let store = SqlEdrStore::with_clock(
            Connection::open(&db_path)?,
            secrets.clone(),
            clock.clone(),
        )?;
        store.save(&entry("tp1", "a1", "ag1"), &edr("edr1")).await?;
    }

    let reopened =
        SqlEdrStore::with_clock(Connection::open(&db_path)?, secrets, clock)?;
    let stored = reopened.find_by_transfer_process_id("tp1").await?;
    assert_eq!(stored.asset_id, "a1");
    let resolved = reopened.resolve_reference("tp1").await?.expect("credential present");
    assert_eq!(resolved.id, "edr1");
    Ok(())
}

#[tokio::test]
async fn unknown_operand_rejected_identically() -> Result<()> {
    let memory = memory_store(TestClock::starting_at(1_000_000));
    let sql = sql_store(TestClock::starting_at(1_000_000));
    let spec = QuerySpec::max().with_filter(Criterion::eq("shoeSize", "42"));

    let from_memory = memory.query_for_entries(&spec).await;
    let from_sql = sql.query_for_entries(&spec).await;

    let memory_msg = match from_memory {
        Err(StoreError::InvalidQuery(msg)) => msg,
        other => panic!("expected InvalidQuery from memory store, got {other:?}"),
    };
    let sql_msg = match from_sql {
        Err(StoreError::InvalidQuery(msg)) => msg,
        other => panic!("expected InvalidQuery from sql store, got {other:?}"),
    };
    assert_eq!(memory_msg, sql_msg);
    Ok(())
}
