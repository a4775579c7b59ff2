//! Per-tenant data-key lifecycle: create, fetch, rotate, delete.
//!
//! # Lifecycle
//!
//! 1. [`DataKeyRegistry::create_data_key`] asks the key service to mint a
//!    256-bit data key wrapped under the master key and stores only the
//!    wrapped form. The plaintext returned alongside is discarded.
//! 2. [`DataKeyRegistry::fetch_data_key`] serves the plaintext from the cache,
//!    or unwraps the stored record and caches the result. Keys are cached on
//!    first fetch, never on create.
//! 3. [`DataKeyRegistry::rotate_data_key`] replaces the wrapped key with a
//!    freshly minted one and evicts the cached plaintext, so the next fetch
//!    unwraps the new key.
//! 4. [`DataKeyRegistry::delete_data_key`] forgets the record and the cached
//!    plaintext.
//!
//! # Locking
//!
//! Records and cache share one `RwLock`. Key-service calls run with that lock
//! released; the result is committed in a short exclusive section. Operations
//! that call the key service for the same tenant are serialised by a
//! per-tenant mutex, so concurrent cache misses trigger a single unwrap and a
//! fetch never races a rotation of the same tenant.
//!
//! # Security invariants
//!
//! - The plaintext data key is **never** written to a snapshot, logged, or
//!   included in traces.
//! - Cached plaintext is always derivable from the current record; it is
//!   dropped whenever the record changes.

pub mod record;
pub mod store;

pub use record::{DataKeyRecord, CONTEXT_CREATED_AT, CONTEXT_ROTATED_AT, CONTEXT_TENANT_ID};
pub use store::DekBytes;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use common::{DataKeyDocument, EncryptionContext, WrapError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::crypto::KEY_LEN;
use crate::kms::KeyWrapper;
use store::KeyTable;

/// Default deadline for a single key-service call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A record already exists for the tenant.
    #[error("data key already exists for tenant {0}")]
    AlreadyExists(String),

    /// No record exists for the tenant.
    #[error("no data key found for tenant {0}")]
    NotFound(String),

    /// The key service failed, timed out, or returned unusable material.
    #[error("data key for tenant {tenant} unavailable ({op}): {source}")]
    KeyUnavailable {
        op: &'static str,
        tenant: String,
        #[source]
        source: WrapError,
    },

    /// The record was replaced by a snapshot import while the key service
    /// call was in flight.
    #[error("data key record for tenant {0} changed during the operation")]
    Conflict(String),

    /// A snapshot entry's context names a different tenant than its key.
    #[error("snapshot entry {tenant} carries context for tenant {context_tenant}")]
    TenantMismatch {
        tenant: String,
        context_tenant: String,
    },

    /// A snapshot document could not be parsed or produced.
    #[error("invalid data key snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Thread-safe registry of per-tenant data keys.
///
/// Cheap to clone; clones share state. Independent registries created with
/// [`DataKeyRegistry::new`] share nothing.
#[derive(Clone)]
pub struct DataKeyRegistry {
    wrapper: Arc<dyn KeyWrapper>,
    clock: Arc<dyn Clock>,
    master_key_id: Arc<str>,
    call_timeout: Duration,
    table: Arc<RwLock<KeyTable>>,
    tenant_locks: LockMap,
}

type LockMap = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

fn lock_map(locks: &LockMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on one tenant's key-service mutex.
///
/// Dropping it releases the mutex and removes the tenant's map entry when no
/// other caller holds or awaits it, so the map never outgrows the set of
/// tenants with an operation in flight.
struct TenantGuard {
    locks: LockMap,
    tenant: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TenantGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        if locks
            .get(&self.tenant)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&self.tenant);
        }
    }
}

impl std::fmt::Debug for DataKeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKeyRegistry")
            .field("master_key_id", &self.master_key_id)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl DataKeyRegistry {
    /// Create an empty registry wrapping keys under `master_key_id`.
    pub fn new(wrapper: Arc<dyn KeyWrapper>, master_key_id: impl Into<String>) -> Self {
        let master_key_id: String = master_key_id.into();
        Self {
            wrapper,
            clock: Arc::new(SystemClock),
            master_key_id: master_key_id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            table: Arc::new(RwLock::new(KeyTable::default())),
            tenant_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline applied to every key-service call. A call that exceeds it
    /// fails with [`RegistryError::KeyUnavailable`].
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn master_key_id(&self) -> &str {
        &self.master_key_id
    }

    /// Create the tenant's data key.
    ///
    /// The key service mints the key under a context of `{tenant_id,
    /// created_at}`. Only the wrapped form is stored; the plaintext cache is
    /// left untouched until the first [`fetch_data_key`](Self::fetch_data_key).
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] if the tenant has a record (including
    /// one committed by a concurrent caller while this call was waiting on the
    /// key service), [`RegistryError::KeyUnavailable`] if the key service
    /// fails.
    #[instrument(skip(self))]
    pub async fn create_data_key(&self, tenant: &str) -> Result<DataKeyRecord, RegistryError> {
        let _guard = self.lock_tenant(tenant).await;

        if self.table.read().await.records.contains_key(tenant) {
            return Err(RegistryError::AlreadyExists(tenant.to_owned()));
        }

        let now = self.clock.now();
        let mut context = EncryptionContext::new();
        context.insert(CONTEXT_TENANT_ID.into(), tenant.to_owned());
        context.insert(CONTEXT_CREATED_AT.into(), rfc3339(now));

        let wrapped = self.mint("create", tenant, &context).await?;
        let record = DataKeyRecord {
            tenant_id: tenant.to_owned(),
            wrapped_key: wrapped,
            created_at: now,
            last_rotated_at: now,
            context,
        };

        let mut table = self.table.write().await;
        if table.records.contains_key(tenant) {
            return Err(RegistryError::AlreadyExists(tenant.to_owned()));
        }
        table.records.insert(tenant.to_owned(), record.clone());
        info!(tenant, "data key created");
        Ok(record)
    }

    /// Return the tenant's plaintext data key.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the tenant has no record,
    /// [`RegistryError::KeyUnavailable`] if unwrapping fails or times out.
    #[instrument(skip(self))]
    pub async fn fetch_data_key(&self, tenant: &str) -> Result<DekBytes, RegistryError> {
        if let Some(key) = self.cached(tenant).await {
            return Ok(key);
        }

        let _guard = self.lock_tenant(tenant).await;

        // Another caller may have filled the cache while we waited.
        let record = {
            let table = self.table.read().await;
            if let Some(key) = table.cache.get(tenant) {
                return Ok(key.clone());
            }
            table
                .records
                .get(tenant)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(tenant.to_owned()))?
        };

        let plaintext = self
            .call(
                "fetch",
                tenant,
                self.wrapper
                    .unwrap_key(&self.master_key_id, &record.wrapped_key, &record.context),
            )
            .await?;
        let key = DekBytes::from_slice(&plaintext).map_err(|len| {
            unavailable(
                "fetch",
                tenant,
                WrapError::MalformedResponse(format!(
                    "unwrapped key is {len} bytes, expected {KEY_LEN}"
                )),
            )
        })?;

        let mut guard = self.table.write().await;
        let table = &mut *guard;
        match table.records.get(tenant) {
            Some(current) if current.wrapped_key == record.wrapped_key => {
                table.cache.insert(tenant.to_owned(), key.clone());
                debug!(tenant, "data key cached");
                Ok(key)
            }
            Some(_) => Err(RegistryError::Conflict(tenant.to_owned())),
            None => Err(RegistryError::NotFound(tenant.to_owned())),
        }
    }

    /// Replace the tenant's data key with a newly minted one.
    ///
    /// `rotated_at` is merged into the stored context and the new key is
    /// wrapped under the merged context. The cached plaintext is evicted in
    /// the same exclusive section that installs the new record.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the tenant has no record,
    /// [`RegistryError::KeyUnavailable`] if the key service fails. On error
    /// the existing record and cache are left unchanged.
    #[instrument(skip(self))]
    pub async fn rotate_data_key(&self, tenant: &str) -> Result<DataKeyRecord, RegistryError> {
        let _guard = self.lock_tenant(tenant).await;

        let current = self
            .table
            .read()
            .await
            .records
            .get(tenant)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tenant.to_owned()))?;

        let now = self.clock.now();
        let mut context = current.context.clone();
        context.insert(CONTEXT_ROTATED_AT.into(), rfc3339(now));

        let wrapped = self.mint("rotate", tenant, &context).await?;

        let mut guard = self.table.write().await;
        let table = &mut *guard;
        let record = match table.records.get_mut(tenant) {
            Some(r) if r.wrapped_key == current.wrapped_key => r,
            Some(_) => return Err(RegistryError::Conflict(tenant.to_owned())),
            None => return Err(RegistryError::NotFound(tenant.to_owned())),
        };
        record.wrapped_key = wrapped;
        record.last_rotated_at = now;
        record.context = context;
        let updated = record.clone();
        table.cache.remove(tenant);

        info!(tenant, "data key rotated");
        Ok(updated)
    }

    /// Forget the tenant's record and cached plaintext. Deleting an absent
    /// tenant is a no-op.
    #[instrument(skip(self))]
    pub async fn delete_data_key(&self, tenant: &str) {
        let existed = self.table.write().await.remove(tenant);
        if existed {
            info!(tenant, "data key deleted");
        }
    }

    /// Copy of one tenant's record, without plaintext.
    pub async fn describe_data_key(&self, tenant: &str) -> Option<DataKeyRecord> {
        self.table.read().await.records.get(tenant).cloned()
    }

    /// Copies of every record, sorted by tenant id.
    pub async fn list_data_keys(&self) -> Vec<DataKeyRecord> {
        let mut records: Vec<DataKeyRecord> =
            self.table.read().await.records.values().cloned().collect();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        records
    }

    /// Number of tenants with a record.
    pub async fn len(&self) -> usize {
        self.table.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.records.is_empty()
    }

    /// Number of tenants whose plaintext key is currently cached.
    pub async fn cached_key_count(&self) -> usize {
        self.table.read().await.cache.len()
    }

    /// Export every record (never the cache) in the persisted format.
    pub async fn export_snapshot(&self) -> DataKeyDocument {
        let table = self.table.read().await;
        let keys = table
            .records
            .iter()
            .map(|(tenant, record)| (tenant.clone(), record.to_entry()))
            .collect();
        DataKeyDocument { keys }
    }

    /// Replace the whole record set with `doc` and drop all cached plaintext.
    ///
    /// # Errors
    ///
    /// [`RegistryError::TenantMismatch`] if an entry's `tenant_id` context
    /// value differs from the tenant it is filed under. The registry is left
    /// unchanged.
    pub async fn import_snapshot(&self, doc: DataKeyDocument) -> Result<(), RegistryError> {
        for (tenant, entry) in &doc.keys {
            match entry.context.get(CONTEXT_TENANT_ID) {
                Some(owner) if owner != tenant => {
                    return Err(RegistryError::TenantMismatch {
                        tenant: tenant.clone(),
                        context_tenant: owner.clone(),
                    })
                }
                _ => {}
            }
        }

        let count = doc.len();
        let records = doc
            .keys
            .into_iter()
            .map(|(tenant, entry)| {
                let record = DataKeyRecord::from_entry(tenant.clone(), entry);
                (tenant, record)
            })
            .collect();
        self.table.write().await.replace_all(records);
        info!(count, "data key snapshot imported");
        Ok(())
    }

    /// [`export_snapshot`](Self::export_snapshot) serialised as JSON.
    pub async fn export_json(&self) -> Result<String, RegistryError> {
        Ok(self.export_snapshot().await.to_json()?)
    }

    /// Parse a JSON snapshot and [`import_snapshot`](Self::import_snapshot)
    /// it. A document that fails to parse or validate leaves the registry
    /// unchanged.
    pub async fn import_json(&self, json: &str) -> Result<(), RegistryError> {
        let doc = DataKeyDocument::from_json(json)?;
        self.import_snapshot(doc).await
    }

    async fn cached(&self, tenant: &str) -> Option<DekBytes> {
        self.table.read().await.cache.get(tenant).cloned()
    }

    async fn lock_tenant(&self, tenant: &str) -> TenantGuard {
        let lock = lock_map(&self.tenant_locks)
            .entry(tenant.to_owned())
            .or_default()
            .clone();
        TenantGuard {
            locks: self.tenant_locks.clone(),
            tenant: tenant.to_owned(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Ask the key service for a new data key and keep only its wrapped form.
    async fn mint(
        &self,
        op: &'static str,
        tenant: &str,
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, RegistryError> {
        let generated = self
            .call(
                op,
                tenant,
                self.wrapper.generate_data_key(&self.master_key_id, context),
            )
            .await?;
        if generated.plaintext.len() != KEY_LEN {
            return Err(unavailable(
                op,
                tenant,
                WrapError::MalformedResponse(format!(
                    "generated key is {} bytes, expected {KEY_LEN}",
                    generated.plaintext.len()
                )),
            ));
        }
        Ok(generated.wrapped)
    }

    /// Run one key-service call under the configured deadline.
    async fn call<T, F>(&self, op: &'static str, tenant: &str, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, WrapError>>,
    {
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(WrapError::Timeout(self.call_timeout)),
        };
        result.map_err(|source| {
            warn!(tenant, op, error = %source, "key service call failed");
            unavailable(op, tenant, source)
        })
    }
}

fn unavailable(op: &'static str, tenant: &str, source: WrapError) -> RegistryError {
    RegistryError::KeyUnavailable {
        op,
        tenant: tenant.to_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kms::{GeneratedDataKey, LocalKeyWrapper, MockKeyWrapper};
    use chrono::TimeZone;
    use zeroize::Zeroizing;

    const MK: &str = "master-1";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn registry() -> (DataKeyRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let kms = Arc::new(LocalKeyWrapper::new().with_random_master_key(MK));
        let reg = DataKeyRegistry::new(kms, MK).with_clock(clock.clone());
        (reg, clock)
    }

    #[tokio::test]
    async fn create_stores_wrapped_key_without_caching() {
        let (reg, _) = registry();
        let record = reg.create_data_key("org1").await.unwrap();
        assert_eq!(record.tenant_id, "org1");
        assert_eq!(record.created_at, start());
        assert_eq!(record.last_rotated_at, start());
        assert_eq!(record.context[CONTEXT_TENANT_ID], "org1");
        assert_eq!(record.context[CONTEXT_CREATED_AT], "2024-05-01T12:00:00Z");
        assert!(!record.is_rotated());
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.cached_key_count().await, 0);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        let err = reg.create_data_key("org1").await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(t) if t == "org1"));
    }

    #[tokio::test]
    async fn fetch_populates_cache_and_is_stable() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        let first = reg.fetch_data_key("org1").await.unwrap();
        assert_eq!(reg.cached_key_count().await, 1);
        let second = reg.fetch_data_key("org1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fetch_unknown_tenant_is_not_found() {
        let (reg, _) = registry();
        let err = reg.fetch_data_key("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(t) if t == "ghost"));
    }

    #[tokio::test]
    async fn rotate_replaces_key_and_evicts_cache() {
        let (reg, clock) = registry();
        let created = reg.create_data_key("org1").await.unwrap();
        let old_key = reg.fetch_data_key("org1").await.unwrap();

        clock.advance(Duration::from_secs(3600));
        let rotated = reg.rotate_data_key("org1").await.unwrap();
        assert_ne!(rotated.wrapped_key, created.wrapped_key);
        assert_eq!(rotated.created_at, created.created_at);
        assert_eq!(rotated.last_rotated_at, start() + chrono::Duration::hours(1));
        assert_eq!(rotated.context[CONTEXT_ROTATED_AT], "2024-05-01T13:00:00Z");
        assert_eq!(rotated.context[CONTEXT_TENANT_ID], "org1");
        assert!(rotated.is_rotated());
        assert_eq!(reg.cached_key_count().await, 0);

        let new_key = reg.fetch_data_key("org1").await.unwrap();
        assert_ne!(old_key, new_key);
    }

    #[tokio::test]
    async fn rotate_unknown_tenant_is_not_found() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.rotate_data_key("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        reg.fetch_data_key("org1").await.unwrap();
        reg.delete_data_key("org1").await;
        reg.delete_data_key("org1").await;
        assert!(reg.is_empty().await);
        assert_eq!(reg.cached_key_count().await, 0);
        assert!(matches!(
            reg.fetch_data_key("org1").await,
            Err(RegistryError::NotFound(_))
        ));
        // A deleted tenant can be created again.
        reg.create_data_key("org1").await.unwrap();
    }

    #[tokio::test]
    async fn list_is_sorted_and_plaintext_free() {
        let (reg, _) = registry();
        for t in ["c", "a", "b"] {
            reg.create_data_key(t).await.unwrap();
        }
        let ids: Vec<String> = reg
            .list_data_keys()
            .await
            .into_iter()
            .map(|r| r.tenant_id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(reg.describe_data_key("a").await.is_some());
        assert!(reg.describe_data_key("z").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_usable_keys() {
        let kms = Arc::new(LocalKeyWrapper::new().with_random_master_key(MK));
        let a = DataKeyRegistry::new(kms.clone(), MK);
        a.create_data_key("org1").await.unwrap();
        a.create_data_key("org2").await.unwrap();
        let key = a.fetch_data_key("org1").await.unwrap();

        let json = a.export_json().await.unwrap();
        assert!(json.contains("org1"));

        let b = DataKeyRegistry::new(kms, MK);
        b.import_json(&json).await.unwrap();
        assert_eq!(b.len().await, 2);
        assert_eq!(b.cached_key_count().await, 0);
        assert_eq!(b.fetch_data_key("org1").await.unwrap(), key);
        assert_eq!(b.list_data_keys().await, a.list_data_keys().await);
    }

    #[tokio::test]
    async fn import_replaces_everything_and_drops_cache() {
        let (reg, _) = registry();
        reg.create_data_key("old").await.unwrap();
        reg.fetch_data_key("old").await.unwrap();

        reg.import_snapshot(DataKeyDocument::default()).await.unwrap();
        assert!(reg.is_empty().await);
        assert_eq!(reg.cached_key_count().await, 0);
    }

    #[tokio::test]
    async fn bad_snapshot_leaves_registry_unchanged() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        assert!(matches!(
            reg.import_json("not json").await,
            Err(RegistryError::Snapshot(_))
        ));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn unwrap_failure_is_key_unavailable() {
        let mut mock = MockKeyWrapper::new();
        mock.expect_generate_data_key().returning(|_, _| {
            Ok(GeneratedDataKey {
                plaintext: Zeroizing::new(vec![0u8; KEY_LEN]),
                wrapped: vec![1, 2, 3],
            })
        });
        mock.expect_unwrap_key()
            .returning(|_, _, _| Err(WrapError::service("AccessDeniedException")));

        let reg = DataKeyRegistry::new(Arc::new(mock), MK);
        reg.create_data_key("org1").await.unwrap();
        let err = reg.fetch_data_key("org1").await.unwrap_err();
        match err {
            RegistryError::KeyUnavailable { op, tenant, source } => {
                assert_eq!(op, "fetch");
                assert_eq!(tenant, "org1");
                assert!(source.to_string().contains("AccessDeniedException"));
            }
            other => panic!("expected KeyUnavailable, got {other:?}"),
        }
        assert_eq!(reg.cached_key_count().await, 0);
    }

    #[tokio::test]
    async fn generate_failure_leaves_no_record() {
        let mut mock = MockKeyWrapper::new();
        mock.expect_generate_data_key()
            .returning(|_, _| Err(WrapError::service("throttled")));
        let reg = DataKeyRegistry::new(Arc::new(mock), MK);
        assert!(matches!(
            reg.create_data_key("org1").await,
            Err(RegistryError::KeyUnavailable { op: "create", .. })
        ));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn rotate_failure_keeps_old_record_and_cache() {
        let mut mock = MockKeyWrapper::new();
        let mut calls = 0;
        mock.expect_generate_data_key().returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(GeneratedDataKey {
                    plaintext: Zeroizing::new(vec![7u8; KEY_LEN]),
                    wrapped: vec![9, 9, 9],
                })
            } else {
                Err(WrapError::service("unavailable"))
            }
        });
        mock.expect_unwrap_key()
            .times(1)
            .returning(|_, _, _| Ok(Zeroizing::new(vec![7u8; KEY_LEN])));

        let reg = DataKeyRegistry::new(Arc::new(mock), MK);
        let created = reg.create_data_key("org1").await.unwrap();
        reg.fetch_data_key("org1").await.unwrap();

        assert!(reg.rotate_data_key("org1").await.is_err());
        assert_eq!(reg.describe_data_key("org1").await.unwrap(), created);
        assert_eq!(reg.cached_key_count().await, 1);
        reg.fetch_data_key("org1").await.unwrap();
    }

    #[tokio::test]
    async fn wrong_length_key_material_is_rejected() {
        let mut mock = MockKeyWrapper::new();
        mock.expect_generate_data_key().returning(|_, _| {
            Ok(GeneratedDataKey {
                plaintext: Zeroizing::new(vec![0u8; 16]),
                wrapped: vec![1],
            })
        });
        let reg = DataKeyRegistry::new(Arc::new(mock), MK);
        let err = reg.create_data_key("org1").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::KeyUnavailable {
                source: WrapError::MalformedResponse(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn snapshot_with_foreign_tenant_context_is_rejected() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        reg.create_data_key("keep").await.unwrap();
        let mut doc = reg.export_snapshot().await;
        doc.keys
            .get_mut("org1")
            .unwrap()
            .context
            .insert(CONTEXT_TENANT_ID.into(), "org2".into());

        let err = reg.import_snapshot(doc).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::TenantMismatch { ref tenant, ref context_tenant }
                if tenant == "org1" && context_tenant == "org2"
        ));
        assert_eq!(reg.len().await, 2);
        assert!(reg.fetch_data_key("org1").await.is_ok());
    }

    #[tokio::test]
    async fn context_mismatch_surfaces_as_key_unavailable() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        let mut doc = reg.export_snapshot().await;
        doc.keys
            .get_mut("org1")
            .unwrap()
            .context
            .insert(CONTEXT_CREATED_AT.into(), "1999-01-01T00:00:00Z".into());
        reg.import_snapshot(doc).await.unwrap();

        assert!(matches!(
            reg.fetch_data_key("org1").await,
            Err(RegistryError::KeyUnavailable { op: "fetch", .. })
        ));
    }

    struct SlowWrapper;

    #[async_trait::async_trait]
    impl KeyWrapper for SlowWrapper {
        async fn wrap_key(
            &self,
            _: &str,
            _: &[u8],
            _: &EncryptionContext,
        ) -> Result<Vec<u8>, WrapError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }

        async fn unwrap_key(
            &self,
            _: &str,
            _: &[u8],
            _: &EncryptionContext,
        ) -> Result<Zeroizing<Vec<u8>>, WrapError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Zeroizing::new(vec![0u8; KEY_LEN]))
        }

        async fn generate_data_key(
            &self,
            _: &str,
            _: &EncryptionContext,
        ) -> Result<GeneratedDataKey, WrapError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(GeneratedDataKey {
                plaintext: Zeroizing::new(vec![0u8; KEY_LEN]),
                wrapped: vec![1],
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_key_service_times_out() {
        let reg = DataKeyRegistry::new(Arc::new(SlowWrapper), MK)
            .with_call_timeout(Duration::from_millis(100));
        let err = reg.create_data_key("org1").await.unwrap_err();
        match err {
            RegistryError::KeyUnavailable { source, .. } => {
                assert!(matches!(source, WrapError::Timeout(d) if d == Duration::from_millis(100)));
            }
            other => panic!("expected KeyUnavailable, got {other:?}"),
        }
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn tenant_locks_do_not_outlive_calls() {
        let (reg, _) = registry();
        for i in 0..100 {
            let ghost = format!("ghost-{i}");
            assert!(matches!(
                reg.fetch_data_key(&ghost).await,
                Err(RegistryError::NotFound(_))
            ));
            assert!(matches!(
                reg.rotate_data_key(&ghost).await,
                Err(RegistryError::NotFound(_))
            ));
        }
        reg.create_data_key("org1").await.unwrap();
        reg.fetch_data_key("org1").await.unwrap();
        assert!(reg.create_data_key("org1").await.is_err());

        assert!(!reg.is_empty().await);
        assert!(lock_map(&reg.tenant_locks).is_empty());
    }

    #[tokio::test]
    async fn failed_creates_do_not_leave_tenant_locks() {
        let mut mock = MockKeyWrapper::new();
        mock.expect_generate_data_key()
            .returning(|_, _| Err(WrapError::service("throttled")));
        let reg = DataKeyRegistry::new(Arc::new(mock), MK);
        for i in 0..50 {
            assert!(reg.create_data_key(&format!("t{i}")).await.is_err());
        }
        assert!(reg.is_empty().await);
        assert!(lock_map(&reg.tenant_locks).is_empty());
    }

    #[tokio::test]
    async fn waiting_caller_keeps_tenant_lock_alive() {
        let (reg, _) = registry();
        reg.create_data_key("org1").await.unwrap();
        let held = reg.lock_tenant("org1").await;

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.fetch_data_key("org1").await })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert!(lock_map(&reg.tenant_locks).is_empty());
    }
}
