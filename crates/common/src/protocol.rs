//! Persisted data-key record format.
//!
//! The registry exports its record set as a JSON document mapping each tenant
//! id to its wrapped key and metadata:
//!
//! ```text
//! {
//!   "org-1": {
//!     "wrapped_key": "<base64>",
//!     "created_at": "2024-05-01T12:00:00Z",
//!     "last_rotated_at": "2024-05-01T12:00:00Z",
//!     "context": { "tenant_id": "org-1", "created_at": "2024-05-01T12:00:00Z" }
//!   }
//! }
//! ```
//!
//! Plaintext key material never appears in this document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Additional authenticated context bound to a wrapped key.
///
/// A `BTreeMap` keeps iteration order stable so that the same context always
/// serialises to the same bytes.
pub type EncryptionContext = BTreeMap<String, String>;

/// One tenant's entry in a [`DataKeyDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKeyEntry {
    /// Key-service ciphertext of the data key, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the wrapped key was last replaced (equals `created_at` until the
    /// first rotation).
    pub last_rotated_at: DateTime<Utc>,
    /// Context that must be presented to unwrap `wrapped_key`.
    #[serde(default)]
    pub context: EncryptionContext,
}

/// Full record set keyed by tenant id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataKeyDocument {
    pub keys: BTreeMap<String, DataKeyEntry>,
}

impl DataKeyDocument {
    /// Number of tenants in the document.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the document holds no records.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Serialise to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a document previously produced by [`DataKeyDocument::to_json`].
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
