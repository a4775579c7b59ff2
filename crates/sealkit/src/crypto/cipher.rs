//! XChaCha20-Poly1305 sealing and opening of byte payloads.
//!
//! Every call to [`encrypt`] draws a fresh 192-bit nonce from the OS CSPRNG.
//! The extended nonce makes random generation safe for the lifetime of a key;
//! **never** reuse a nonce under the same key, it breaks both confidentiality
//! and authentication.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

/// Byte length of a data key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an XChaCha20 nonce (24 bytes = 192 bits).
pub const NONCE_LEN: usize = 24;

/// Byte length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The sealed payload cannot even hold a nonce.
    #[error("ciphertext too short: {0} < {NONCE_LEN} bytes")]
    CiphertextTooShort(usize),

    /// The tag did not verify: wrong key or tampered data.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The AEAD refused to seal the payload (should be unreachable with a
    /// valid key).
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Seal `plaintext` under `key`.
///
/// Output layout: `nonce (24) || ciphertext || tag (16)`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`encrypt`].
///
/// Nothing is returned unless the tag verifies; the tag comparison inside the
/// AEAD is constant time.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes,
/// [`CipherError::CiphertextTooShort`] if `sealed` is shorter than a nonce and
/// [`CipherError::AuthenticationFailed`] on a wrong key or tampered data.
pub fn decrypt(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    if sealed.len() < NONCE_LEN {
        return Err(CipherError::CiphertextTooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::AuthenticationFailed)
}

fn build_cipher(key: &[u8]) -> Result<XChaCha20Poly1305, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}
