//! Per-tenant wrapped data-key record.

use chrono::{DateTime, Utc};
use common::{DataKeyEntry, EncryptionContext};

/// Context key carrying the owning tenant.
pub const CONTEXT_TENANT_ID: &str = "tenant_id";
/// Context key carrying the creation instant (RFC 3339).
pub const CONTEXT_CREATED_AT: &str = "created_at";
/// Context key carrying the most recent rotation instant (RFC 3339).
pub const CONTEXT_ROTATED_AT: &str = "rotated_at";

/// Authoritative record of one tenant's data key.
///
/// Holds only the key-service ciphertext; the plaintext lives in the
/// registry cache and is never attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKeyRecord {
    pub tenant_id: String,
    pub wrapped_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    pub context: EncryptionContext,
}

impl DataKeyRecord {
    pub(crate) fn from_entry(tenant_id: String, entry: DataKeyEntry) -> Self {
        Self {
            tenant_id,
            wrapped_key: entry.wrapped_key,
            created_at: entry.created_at,
            last_rotated_at: entry.last_rotated_at,
            context: entry.context,
        }
    }

    pub(crate) fn to_entry(&self) -> DataKeyEntry {
        DataKeyEntry {
            wrapped_key: self.wrapped_key.clone(),
            created_at: self.created_at,
            last_rotated_at: self.last_rotated_at,
            context: self.context.clone(),
        }
    }

    /// Returns `true` once the record has been rotated at least once.
    pub fn is_rotated(&self) -> bool {
        self.context.contains_key(CONTEXT_ROTATED_AT)
    }
}
