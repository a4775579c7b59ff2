//! Tenant-scoped envelope encryption.
//!
//! Resolves the tenant's plaintext data key through the [`DataKeyRegistry`]
//! and seals the payload with it. Tokens are standard base64 of
//! `nonce (24) || ciphertext || tag (16)`. The service keeps no state of its
//! own; caching is the registry's job.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::crypto::{self, CipherError};
use crate::dek::{DataKeyRegistry, RegistryError};

/// Errors produced by the envelope layer. Registry and cipher errors pass
/// through unchanged.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// The token is not valid base64.
    #[error("ciphertext token is not valid base64")]
    InvalidEncoding,
}

/// Encrypt/decrypt facade over a [`DataKeyRegistry`].
#[derive(Clone, Debug)]
pub struct EnvelopeService {
    registry: DataKeyRegistry,
}

impl EnvelopeService {
    pub fn new(registry: DataKeyRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DataKeyRegistry {
        &self.registry
    }

    /// Encrypt `plaintext` under the tenant's data key.
    ///
    /// # Errors
    ///
    /// Whatever [`DataKeyRegistry::fetch_data_key`] returns, or a
    /// [`CipherError`].
    pub async fn encrypt(&self, tenant: &str, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let key = self.registry.fetch_data_key(tenant).await?;
        let sealed = crypto::encrypt(key.as_bytes(), plaintext)?;
        Ok(STANDARD.encode(sealed))
    }

    /// Decrypt a token produced by [`EnvelopeService::encrypt`] for the same
    /// tenant.
    ///
    /// # Errors
    ///
    /// Registry errors first (an unknown tenant is `NotFound` even for a
    /// garbage token), then [`EnvelopeError::InvalidEncoding`],
    /// [`CipherError::CiphertextTooShort`] or
    /// [`CipherError::AuthenticationFailed`].
    pub async fn decrypt(&self, tenant: &str, token: &str) -> Result<Vec<u8>, EnvelopeError> {
        let key = self.registry.fetch_data_key(tenant).await?;
        let sealed = STANDARD
            .decode(token)
            .map_err(|_| EnvelopeError::InvalidEncoding)?;
        Ok(crypto::decrypt(key.as_bytes(), &sealed)?)
    }
}
