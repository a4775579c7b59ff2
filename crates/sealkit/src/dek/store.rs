//! [`KeyTable`]: the registry's authoritative records plus the derived
//! plaintext cache, and [`DekBytes`], the cached key buffer.

use std::collections::HashMap;

use zeroize::Zeroize;

use super::record::DataKeyRecord;
use crate::crypto::KEY_LEN;

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Stored in the plaintext cache and cloned out to callers for the duration
/// of one encrypt/decrypt. When this type is dropped, the memory is
/// overwritten with zeroes.
#[derive(Clone)]
pub struct DekBytes(Box<[u8; KEY_LEN]>);

impl DekBytes {
    /// Copy `key_bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns the offending length if `key_bytes` is not [`KEY_LEN`] bytes.
    pub fn from_slice(key_bytes: &[u8]) -> Result<Self, usize> {
        if key_bytes.len() != KEY_LEN {
            return Err(key_bytes.len());
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(key_bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for DekBytes {
    fn drop(&mut self) {
        self.0[..].zeroize();
    }
}

impl PartialEq for DekBytes {
    fn eq(&self, other: &Self) -> bool {
        crate::crypto::constant_time_eq(self.as_bytes(), other.as_bytes())
    }
}

impl Eq for DekBytes {}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("DekBytes([REDACTED])")
    }
}

/// Wrapped-key records and the plaintext cache derived from them.
///
/// Both maps live behind the registry's single `RwLock`. The cache only ever
/// holds keys obtained by unwrapping the current record for the same tenant,
/// so it can be dropped at any time.
#[derive(Debug, Default)]
pub(crate) struct KeyTable {
    pub(crate) records: HashMap<String, DataKeyRecord>,
    pub(crate) cache: HashMap<String, DekBytes>,
}

impl KeyTable {
    /// Drop a tenant's record and cached key. Returns whether a record
    /// existed.
    pub(crate) fn remove(&mut self, tenant: &str) -> bool {
        self.cache.remove(tenant);
        self.records.remove(tenant).is_some()
    }

    /// Replace every record and forget all cached plaintext.
    pub(crate) fn replace_all(&mut self, records: HashMap<String, DataKeyRecord>) {
        self.cache.clear();
        self.records = records;
    }
}
