use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lease::{Lease, LeaseError, LeaseManager, DEFAULT_LEASE_DURATION};
use crate::model::{EndpointDataReference, EndpointDataReferenceEntry};
use crate::query::fields::{lookup, FieldKind};
use crate::query::{CriterionOperator, OperandRight, QuerySpec, SortOrder};
use crate::utils::time::{Clock, SystemClock};

use super::{stamp_for_save, EdrStore, StoreError, VAULT_PREFIX};

const ENTRY_COLUMNS: &str = "transfer_process_id, asset_id, agreement_id, provider_id, \
     edr_id, contract_negotiation_id, expiration_timestamp, state, state_count, \
     state_timestamp, error_detail, created_at, updated_at";

/// SQLite-backed implementation of the cache.
///
/// Entry metadata lives in `edr_cache`; the credential JSON goes to the
/// injected secret store under `edr--{edr_id}`. Every mutation runs in one
/// SQLite transaction that also performs the lease check, so the at-most-one
/// -writer guarantee holds across processes sharing the database file.
pub struct SqlEdrStore {
    conn: Arc<Mutex<Connection>>,
    secrets: Arc<dyn crate::vault::SecretStore>,
    clock: Arc<dyn Clock>,
    lock_id: String,
    lease_duration: Duration,
}

impl SqlEdrStore {
    pub fn new(
        conn: Connection,
        secrets: Arc<dyn crate::vault::SecretStore>,
    ) -> Result<Self, StoreError> {
        Self::with_clock(conn, secrets, Arc::new(SystemClock))
    }

    pub fn with_clock(
        conn: Connection,
        secrets: Arc<dyn crate::vault::SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            secrets,
            clock,
            lock_id: Uuid::new_v4().to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
        })
    }

    /// Lease handle over the same database, for callers that need to hold a
    /// key across a longer read-modify-write sequence.
    pub fn lease_manager(&self) -> SqlLeaseManager {
        SqlLeaseManager {
            conn: self.conn.clone(),
            clock: self.clock.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock_conn(&self.conn)
    }

    fn secret_key(edr_id: &str) -> String {
        format!("{VAULT_PREFIX}{edr_id}")
    }

    fn edr_id_for(&self, transfer_process_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let edr_id = conn
            .query_row(
                "SELECT edr_id FROM edr_cache WHERE transfer_process_id = ?1",
                params![transfer_process_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(edr_id)
    }

    /// Runs the relational part of `save` in one transaction and returns the
    /// previously stored credential id, if the key was occupied.
    fn persist_pair(
        &self,
        stored: &EndpointDataReferenceEntry,
        edr: &EndpointDataReference,
    ) -> Result<Option<String>, StoreError> {
        let now = self.clock.millis();
        let key = stored.transfer_process_id.as_str();

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        reject_foreign_lease(&tx, key, &self.lock_id, now)?;
        let prior: Option<String> = tx
            .query_row(
                "SELECT edr_id FROM edr_cache WHERE transfer_process_id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO edr_cache (transfer_process_id, asset_id, agreement_id, \
                 provider_id, edr_id, contract_negotiation_id, expiration_timestamp, \
                 state, state_count, state_timestamp, error_detail, created_at, \
                 updated_at, lease_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL) \
             ON CONFLICT(transfer_process_id) DO UPDATE SET \
                 asset_id = excluded.asset_id, \
                 agreement_id = excluded.agreement_id, \
                 provider_id = excluded.provider_id, \
                 edr_id = excluded.edr_id, \
                 contract_negotiation_id = excluded.contract_negotiation_id, \
                 expiration_timestamp = excluded.expiration_timestamp, \
                 state = excluded.state, \
                 state_count = excluded.state_count, \
                 state_timestamp = excluded.state_timestamp, \
                 error_detail = excluded.error_detail, \
                 created_at = excluded.created_at, \
                 updated_at = excluded.updated_at, \
                 lease_id = NULL",
            params![
                stored.transfer_process_id,
                stored.asset_id,
                stored.agreement_id,
                stored.provider_id,
                edr.id,
                stored.contract_negotiation_id,
                stored.expiration_timestamp,
                stored.state,
                stored.state_count,
                stored.state_timestamp,
                stored.error_detail,
                stored.created_at,
                stored.updated_at,
            ],
        )?;
        tx.execute("DELETE FROM edr_lease WHERE entity_id = ?1", params![key])?;
        tx.commit()?;
        Ok(prior)
    }

    /// Transactional part of delete: lease check, row removal.
    fn remove_pair(
        &self,
        transfer_process_id: &str,
    ) -> Result<(EndpointDataReferenceEntry, String), StoreError> {
        let now = self.clock.millis();
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        reject_foreign_lease(&tx, transfer_process_id, &self.lock_id, now)?;
        let found = tx
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM edr_cache WHERE transfer_process_id = ?1"),
                params![transfer_process_id],
                |row| Ok((map_entry(row)?, row.get::<_, String>(4)?)),
            )
            .optional()?;

        let (entry, edr_id) = match found {
            Some(pair) => pair,
            None => return Err(StoreError::NotFound(transfer_process_id.to_string())),
        };

        tx.execute(
            "DELETE FROM edr_cache WHERE transfer_process_id = ?1",
            params![transfer_process_id],
        )?;
        tx.execute(
            "DELETE FROM edr_lease WHERE entity_id = ?1",
            params![transfer_process_id],
        )?;
        tx.commit()?;
        Ok((entry, edr_id))
    }

    fn select_entries(&self, where_column: &str, value: &str) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM edr_cache WHERE {where_column} = ?1"
        ))?;
        let rows = stmt.query_map(params![value], map_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn load_reference(&self, edr_id: &str) -> Result<Option<EndpointDataReference>, StoreError> {
        match self.secrets.get(&Self::secret_key(edr_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => {
                warn!(edr_id, "credential secret missing for stored entry");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl EdrStore for SqlEdrStore {
    async fn resolve_reference(
        &self,
        transfer_process_id: &str,
    ) -> Result<Option<EndpointDataReference>, StoreError> {
        match self.edr_id_for(transfer_process_id)? {
            Some(edr_id) => self.load_reference(&edr_id).await,
            None => Ok(None),
        }
    }

    async fn find_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM edr_cache WHERE transfer_process_id = ?1"),
            params![transfer_process_id],
            map_entry,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(transfer_process_id.to_string()))
    }

    async fn references_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReference>, StoreError> {
        let edr_ids: Vec<String> = {
            let conn = self.lock();
            let mut stmt =
                conn.prepare("SELECT edr_id FROM edr_cache WHERE asset_id = ?1")?;
            let rows = stmt.query_map(params![asset_id], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut references = Vec::with_capacity(edr_ids.len());
        for edr_id in edr_ids {
            if let Some(reference) = self.load_reference(&edr_id).await? {
                references.push(reference);
            }
        }
        Ok(references)
    }

    async fn entries_for_asset(
        &self,
        asset_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        self.select_entries("asset_id", asset_id)
    }

    async fn entries_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        self.select_entries("agreement_id", agreement_id)
    }

    async fn query_for_entries(
        &self,
        spec: &QuerySpec,
    ) -> Result<Vec<EndpointDataReferenceEntry>, StoreError> {
        let (sql, params) = translate_query(spec)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), map_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn save(
        &self,
        entry: &EndpointDataReferenceEntry,
        edr: &EndpointDataReference,
    ) -> Result<(), StoreError> {
        let stored = stamp_for_save(entry, edr, self.clock.millis());
        let prior_edr_id = self.persist_pair(&stored, edr)?;

        let json = serde_json::to_string(edr)?;
        self.secrets.put(&Self::secret_key(&edr.id), &json).await?;

        // replaced credential leaves no orphaned secret behind
        if let Some(old_id) = prior_edr_id.filter(|old| *old != edr.id) {
            if let Err(err) = self.secrets.delete(&Self::secret_key(&old_id)).await {
                warn!(edr_id = %old_id, error = %err, "failed to drop replaced credential secret");
            }
        }
        debug!(transfer_process_id = %stored.transfer_process_id, edr_id = %edr.id, "saved edr entry");
        Ok(())
    }

    async fn delete_by_transfer_process_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<EndpointDataReferenceEntry, StoreError> {
        let (entry, edr_id) = self.remove_pair(transfer_process_id)?;
        // the pair contract: a failed secret delete surfaces as a
        // persistence error instead of silently leaving the blob around
        self.secrets.delete(&Self::secret_key(&edr_id)).await?;
        debug!(transfer_process_id, "deleted edr entry");
        Ok(entry)
    }
}

/// Lease bookkeeping over the `edr_lease` table; the check and the write
/// share one transaction, so acquisition is atomic under SQLite's locking.
pub struct SqlLeaseManager {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager for SqlLeaseManager {
    fn acquire(&self, key: &str, owner: &str, duration: Duration) -> Result<(), LeaseError> {
        let now = self.clock.millis();
        let mut conn = lock_conn(&self.conn);
        let tx = conn.transaction().map_err(lease_backend)?;

        if let Some(lease) = read_lease(&tx, key).map_err(lease_backend)? {
            if lease.is_active(now) && lease.leased_by != owner {
                return Err(LeaseError::AlreadyLeased {
                    key: key.to_string(),
                });
            }
        }

        let lease_id = Uuid::new_v4().to_string();
        tx.execute("DELETE FROM edr_lease WHERE entity_id = ?1", params![key])
            .map_err(lease_backend)?;
        tx.execute(
            "INSERT INTO edr_lease (lease_id, entity_id, leased_by, leased_at, lease_duration) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lease_id, key, owner, now, duration.as_millis() as i64],
        )
        .map_err(lease_backend)?;
        tx.execute(
            "UPDATE edr_cache SET lease_id = ?1 WHERE transfer_process_id = ?2",
            params![lease_id, key],
        )
        .map_err(lease_backend)?;
        tx.commit().map_err(lease_backend)
    }

    fn is_leased(&self, key: &str) -> bool {
        let now = self.clock.millis();
        let conn = lock_conn(&self.conn);
        read_lease(&conn, key)
            .ok()
            .flatten()
            .map(|lease| lease.is_active(now))
            .unwrap_or(false)
    }

    fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        let now = self.clock.millis();
        let mut conn = lock_conn(&self.conn);
        let tx = conn.transaction().map_err(lease_backend)?;

        if let Some(lease) = read_lease(&tx, key).map_err(lease_backend)? {
            if lease.is_active(now) && lease.leased_by != owner {
                return Err(LeaseError::NotOwner {
                    key: key.to_string(),
                    owner: owner.to_string(),
                });
            }
        }

        tx.execute("DELETE FROM edr_lease WHERE entity_id = ?1", params![key])
            .map_err(lease_backend)?;
        tx.execute(
            "UPDATE edr_cache SET lease_id = NULL WHERE transfer_process_id = ?1",
            params![key],
        )
        .map_err(lease_backend)?;
        tx.commit().map_err(lease_backend)
    }
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lease_backend(err: rusqlite::Error) -> LeaseError {
    LeaseError::Backend(err.to_string())
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS edr_cache (
            transfer_process_id TEXT PRIMARY KEY,
            asset_id TEXT NOT NULL,
            agreement_id TEXT NOT NULL,
            provider_id TEXT,
            edr_id TEXT NOT NULL,
            contract_negotiation_id TEXT,
            expiration_timestamp INTEGER,
            state INTEGER NOT NULL DEFAULT 0,
            state_count INTEGER NOT NULL DEFAULT 0,
            state_timestamp INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            lease_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edr_cache_asset_id ON edr_cache(asset_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edr_cache_agreement_id ON edr_cache(agreement_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS edr_lease (
            lease_id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL UNIQUE,
            leased_by TEXT NOT NULL,
            leased_at INTEGER NOT NULL,
            lease_duration INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn read_lease(conn: &Connection, key: &str) -> rusqlite::Result<Option<Lease>> {
    conn.query_row(
        "SELECT leased_by, leased_at, lease_duration FROM edr_lease WHERE entity_id = ?1",
        params![key],
        |row| {
            Ok(Lease {
                leased_by: row.get(0)?,
                leased_at: row.get(1)?,
                lease_duration: row.get(2)?,
            })
        },
    )
    .optional()
}

fn reject_foreign_lease(
    tx: &Transaction<'_>,
    key: &str,
    owner: &str,
    now: i64,
) -> Result<(), StoreError> {
    if let Some(lease) = read_lease(tx, key)? {
        if lease.is_active(now) && lease.leased_by != owner {
            return Err(StoreError::AlreadyLeased(key.to_string()));
        }
    }
    Ok(())
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EndpointDataReferenceEntry> {
    Ok(EndpointDataReferenceEntry {
        transfer_process_id: row.get(0)?,
        asset_id: row.get(1)?,
        agreement_id: row.get(2)?,
        provider_id: row.get(3)?,
        contract_negotiation_id: row.get(5)?,
        expiration_timestamp: row.get(6)?,
        state: row.get(7)?,
        state_count: row.get(8)?,
        state_timestamp: row.get(9)?,
        error_detail: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Translates a query spec into a parameterized SELECT over the same field
/// registry the in-memory evaluator reads, so both paths accept and reject
/// exactly the same operands.
fn translate_query(spec: &QuerySpec) -> Result<(String, Vec<Value>), StoreError> {
    let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM edr_cache");
    let mut params: Vec<Value> = Vec::new();
    let mut clauses: Vec<String> = Vec::new();

    for criterion in &spec.filter_expression {
        let field = lookup(&criterion.operand_left).ok_or_else(|| {
            StoreError::InvalidQuery(format!("unknown query operand '{}'", criterion.operand_left))
        })?;

        let clause = match (&criterion.operator, &criterion.operand_right) {
            (CriterionOperator::Eq, OperandRight::Value(value)) => {
                match bind(field.kind, value) {
                    Some(param) => {
                        params.push(param);
                        format!("{} = ?", field.column)
                    }
                    None => "1 = 0".to_string(),
                }
            }
            (CriterionOperator::NotEq, OperandRight::Value(value)) => {
                match bind(field.kind, value) {
                    Some(param) => {
                        params.push(param);
                        format!("{} != ?", field.column)
                    }
                    None => "1 = 0".to_string(),
                }
            }
            (CriterionOperator::In, right) => {
                let bound: Vec<Value> = right
                    .as_values()
                    .iter()
                    .filter_map(|value| bind(field.kind, value))
                    .collect();
                if bound.is_empty() {
                    "1 = 0".to_string()
                } else {
                    let placeholders = vec!["?"; bound.len()].join(", ");
                    params.extend(bound);
                    format!("{} IN ({placeholders})", field.column)
                }
            }
            // scalar operator with a list operand matches nothing, same as
            // the in-memory evaluator
            _ => "1 = 0".to_string(),
        };
        clauses.push(clause);
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if let Some(sort_field) = &spec.sort_field {
        let field = lookup(sort_field).ok_or_else(|| {
            StoreError::InvalidQuery(format!("unknown query operand '{sort_field}'"))
        })?;
        let direction = match spec.sort_order {
            Some(SortOrder::Desc) => "DESC",
            _ => "ASC",
        };
        sql.push_str(&format!(" ORDER BY {} {direction}", field.column));
    }

    let limit = if spec.limit == usize::MAX {
        -1
    } else {
        spec.limit as i64
    };
    sql.push_str(" LIMIT ? OFFSET ?");
    params.push(Value::Integer(limit));
    params.push(Value::Integer(spec.offset as i64));

    Ok((sql, params))
}

/// Typed parameter binding: numeric registry fields get integer params so
/// comparisons agree with the in-memory evaluator; an unparsable numeric
/// operand matches nothing on either path.
fn bind(kind: FieldKind, value: &str) -> Option<Value> {
    match kind {
        FieldKind::Text => Some(Value::Text(value.to_string())),
        FieldKind::Int => value.parse::<i64>().ok().map(Value::Integer),
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::AlreadyExists(err.to_string())
            }
            _ => StoreError::General(err.to_string()),
        }
    }
}
