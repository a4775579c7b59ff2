//! Boundary to the external key-wrapping service.
//!
//! The registry never sees master key material. It asks a [`KeyWrapper`] to
//! mint, wrap and unwrap data keys under a master key identified by id, always
//! presenting the record's encryption context. Two implementations ship here:
//!
//! - [`aws::AwsKms`] talks to AWS KMS.
//! - [`local::LocalKeyWrapper`] keeps master keys in process memory, for
//!   development and tests.

pub mod aws;
pub mod local;

use async_trait::async_trait;
use common::{EncryptionContext, WrapError};
use zeroize::Zeroizing;

pub use aws::AwsKms;
pub use local::LocalKeyWrapper;

/// A freshly minted data key: the plaintext for immediate use and the
/// service ciphertext for storage.
pub struct GeneratedDataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub wrapped: Vec<u8>,
}

impl std::fmt::Debug for GeneratedDataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedDataKey")
            .field("plaintext", &"[REDACTED]")
            .field("wrapped_len", &self.wrapped.len())
            .finish()
    }
}

/// Operations the registry needs from a key-management service.
///
/// Implementations must bind `context` to the ciphertext: unwrapping with a
/// different context must fail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Encrypt caller-supplied key material under the master key.
    async fn wrap_key(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, WrapError>;

    /// Recover key material previously produced by this service.
    async fn unwrap_key(
        &self,
        master_key_id: &str,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, WrapError>;

    /// Mint a new random 256-bit data key, returned both in plaintext and
    /// wrapped under the master key.
    async fn generate_data_key(
        &self,
        master_key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, WrapError>;
}
