//! XChaCha20-Poly1305 payload encryption primitives.
//!
//! This module is intentionally free of key-service and registry
//! dependencies. It provides the low-level seal/open operations used by the
//! envelope layer, plus the constant-time comparison shared by the password
//! codec.
//!
//! # Sealed format
//!
//! ```text
//! nonce (24 bytes) || ciphertext || tag (16 bytes)
//! ```

pub mod cipher;
pub mod ct;

pub use cipher::{decrypt, encrypt, CipherError, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use ct::constant_time_eq;
