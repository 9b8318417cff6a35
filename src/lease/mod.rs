use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::utils::time::Clock;

/// Default lease lifetime; a crashed holder's lease self-expires after this.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("'{key}' is already leased by another owner")]
    AlreadyLeased { key: String },
    #[error("'{key}' is not leased by '{owner}'")]
    NotOwner { key: String, owner: String },
    #[error("lease persistence failure: {0}")]
    Backend(String),
}

/// Time-bounded exclusive-ownership marker over one record key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub leased_by: String,
    /// Epoch millis at acquisition or last renewal.
    pub leased_at: i64,
    /// Millis after `leased_at` at which the lease lapses.
    pub lease_duration: i64,
}

impl Lease {
    pub fn new(leased_by: impl Into<String>, leased_at: i64, duration: Duration) -> Self {
        Self {
            leased_by: leased_by.into(),
            leased_at,
            lease_duration: duration.as_millis() as i64,
        }
    }

    /// Active iff `leased_at + lease_duration > now`. An expired lease is
    /// logically absent and must not block acquisition.
    pub fn is_active(&self, now_millis: i64) -> bool {
        self.leased_at + self.lease_duration > now_millis
    }
}

/// Grants, renews and releases exclusive time-bounded locks on record keys.
///
/// At most one active lease exists per key. Expired leases are reclaimed
/// lazily on the next acquisition; there is no background sweeper.
pub trait LeaseManager: Send + Sync {
    /// Fails with `AlreadyLeased` when an active lease by a different owner
    /// exists. Re-acquisition by the current owner refreshes `leased_at`.
    fn acquire(&self, key: &str, owner: &str, duration: Duration) -> Result<(), LeaseError>;

    fn is_leased(&self, key: &str) -> bool;

    /// Releasing a free key is a no-op; only an active lease held by a
    /// different owner is rejected.
    fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError>;
}

/// Compare-and-set lease bookkeeping over a single synchronized map.
pub struct InMemoryLeaseManager {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        match self.leases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LeaseManager for InMemoryLeaseManager {
    fn acquire(&self, key: &str, owner: &str, duration: Duration) -> Result<(), LeaseError> {
        let now = self.clock.millis();
        let mut leases = self.lock();
        match leases.get(key) {
            Some(lease) if lease.is_active(now) && lease.leased_by != owner => {
                debug!(key, owner, holder = %lease.leased_by, "lease acquisition rejected");
                Err(LeaseError::AlreadyLeased {
                    key: key.to_string(),
                })
            }
            _ => {
                leases.insert(key.to_string(), Lease::new(owner, now, duration));
                Ok(())
            }
        }
    }

    fn is_leased(&self, key: &str) -> bool {
        let now = self.clock.millis();
        self.lock()
            .get(key)
            .map(|lease| lease.is_active(now))
            .unwrap_or(false)
    }

    fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        let now = self.clock.millis();
        let mut leases = self.lock();
        match leases.get(key) {
            Some(lease) if lease.is_active(now) && lease.leased_by != owner => {
                Err(LeaseError::NotOwner {
                    key: key.to_string(),
                    owner: owner.to_string(),
                })
            }
            _ => {
                leases.remove(key);
                Ok(())
            }
        }
    }
}
