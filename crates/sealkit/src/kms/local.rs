//! In-process [`KeyWrapper`] with master keys held in memory.
//!
//! Wrapped keys are `nonce || ciphertext || tag` under XChaCha20-Poly1305,
//! with the encryption context bound as associated data. Unwrapping with a
//! different context fails exactly as it would against a real KMS.

use std::collections::HashMap;

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use common::{EncryptionContext, WrapError};
use rand::RngCore;
use zeroize::Zeroizing;

use super::{GeneratedDataKey, KeyWrapper};
use crate::crypto::{KEY_LEN, NONCE_LEN};

/// Master keys by id.
#[derive(Default)]
pub struct LocalKeyWrapper {
    master_keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for LocalKeyWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyWrapper")
            .field("master_key_ids", &self.master_keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalKeyWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a master key under `id`.
    pub fn with_master_key(mut self, id: impl Into<String>, key: [u8; KEY_LEN]) -> Self {
        self.master_keys.insert(id.into(), Zeroizing::new(key));
        self
    }

    /// Register a freshly generated master key under `id`.
    pub fn with_random_master_key(self, id: impl Into<String>) -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        self.with_master_key(id, key)
    }

    fn cipher(&self, master_key_id: &str) -> Result<XChaCha20Poly1305, WrapError> {
        let key = self
            .master_keys
            .get(master_key_id)
            .ok_or_else(|| WrapError::UnknownMasterKey(master_key_id.to_owned()))?;
        XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| WrapError::MalformedResponse("master key has invalid length".into()))
    }

    fn seal(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, WrapError> {
        let cipher = self.cipher(master_key_id)?;
        let aad = context_aad(context);
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| WrapError::service("local wrap failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Length-prefixed encoding of the context. `BTreeMap` iteration is sorted,
/// so equal contexts always produce equal bytes.
fn context_aad(context: &EncryptionContext) -> Vec<u8> {
    let mut aad = Vec::new();
    for (k, v) in context {
        aad.extend_from_slice(&(k.len() as u64).to_be_bytes());
        aad.extend_from_slice(k.as_bytes());
        aad.extend_from_slice(&(v.len() as u64).to_be_bytes());
        aad.extend_from_slice(v.as_bytes());
    }
    aad
}

#[async_trait]
impl KeyWrapper for LocalKeyWrapper {
    async fn wrap_key(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, WrapError> {
        self.seal(master_key_id, plaintext, context)
    }

    async fn unwrap_key(
        &self,
        master_key_id: &str,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, WrapError> {
        let cipher = self.cipher(master_key_id)?;
        if wrapped.len() < NONCE_LEN {
            return Err(WrapError::service("wrapped key is truncated"));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
        let aad = context_aad(context);
        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map(Zeroizing::new)
            .map_err(|_| WrapError::service("invalid ciphertext or encryption context mismatch"))
    }

    async fn generate_data_key(
        &self,
        master_key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, WrapError> {
        let mut plaintext = Zeroizing::new(vec![0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut plaintext);
        let wrapped = self.seal(master_key_id, &plaintext, context)?;
        Ok(GeneratedDataKey { plaintext, wrapped })
    }
}
