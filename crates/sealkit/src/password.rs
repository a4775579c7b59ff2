//! Argon2id password hashing in the self-describing PHC-style string format.
//!
//! ```text
//! $argon2id$v=19$m=32768,t=3,p=1$<base64 salt>$<base64 key>
//! ```
//!
//! Base64 is the standard alphabet without padding. The string carries every
//! parameter needed to re-derive the key, so hashes produced under an older
//! configuration keep verifying after the defaults change.
//!
//! [`HashService`] also offers unkeyed BLAKE2b-256 content digests as
//! lowercase hex.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use blake2::{digest::consts::U32, Blake2b, Digest};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::constant_time_eq;

/// Algorithm tag written in the first field.
pub const ALGORITHM_TAG: &str = "argon2id";

/// Argon2 version this codec produces and accepts (0x13).
pub const ARGON2_VERSION: u32 = 0x13;

/// Errors produced by the password codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordHashError {
    /// The string does not have exactly six `$`-separated fields, or names a
    /// different algorithm.
    #[error("argon2id: hash is not in the correct format")]
    InvalidHashFormat,

    /// The embedded version differs from [`ARGON2_VERSION`].
    #[error("argon2id: incompatible version of argon2: {0}")]
    IncompatibleVersion(u32),

    /// A parameter, salt or key field could not be parsed.
    #[error("argon2id: malformed {field} field")]
    MalformedField { field: &'static str },

    /// The parameters are outside what Argon2 accepts.
    #[error("argon2id: invalid parameters: {0}")]
    InvalidParams(String),

    /// The password does not match the hash.
    #[error("invalid password")]
    InvalidPassword,
}

/// Cost parameters for new hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordConfig {
    /// Memory used by the algorithm, in KiB.
    pub memory_cost_kib: u32,
    /// Number of passes over the memory.
    pub iterations: u32,
    /// Number of lanes.
    pub parallelism: u32,
    /// Random salt length in bytes.
    pub salt_length: usize,
    /// Derived key length in bytes.
    pub key_length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: 32 * 1024,
            iterations: 3,
            parallelism: 1,
            salt_length: 16,
            key_length: 32,
        }
    }
}

/// Hash `password` under `config` with a freshly drawn salt.
///
/// # Errors
///
/// Returns [`PasswordHashError::InvalidParams`] if Argon2 rejects the
/// configuration (for instance a salt shorter than 8 bytes).
pub fn hash(config: &PasswordConfig, password: &str) -> Result<String, PasswordHashError> {
    let mut salt = vec![0u8; config.salt_length];
    OsRng.fill_bytes(&mut salt);

    let key = derive(config, password.as_bytes(), &salt)?;
    Ok(encode(config, &salt, &key))
}

/// Check `password` against an encoded hash.
///
/// # Errors
///
/// Returns [`PasswordHashError::InvalidPassword`] on any mismatch, or a
/// format error if `encoded` cannot be parsed.
pub fn verify(password: &str, encoded: &str) -> Result<(), PasswordHashError> {
    let decoded = decode(encoded)?;
    let candidate = derive(&decoded.config, password.as_bytes(), &decoded.salt)?;
    if constant_time_eq(&candidate, &decoded.key) {
        Ok(())
    } else {
        Err(PasswordHashError::InvalidPassword)
    }
}

fn derive(
    config: &PasswordConfig,
    password: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<Vec<u8>>, PasswordHashError> {
    let params = Params::new(
        config.memory_cost_kib,
        config.iterations,
        config.parallelism,
        Some(config.key_length),
    )
    .map_err(|e| PasswordHashError::InvalidParams(e.to_string()))?;

    let mut key = Zeroizing::new(vec![0u8; config.key_length]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| PasswordHashError::InvalidParams(e.to_string()))?;
    Ok(key)
}

fn encode(config: &PasswordConfig, salt: &[u8], key: &[u8]) -> String {
    format!(
        "${ALGORITHM_TAG}$v={ARGON2_VERSION}$m={},t={},p={}${}${}",
        config.memory_cost_kib,
        config.iterations,
        config.parallelism,
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(key),
    )
}

struct DecodedHash {
    config: PasswordConfig,
    salt: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

fn decode(encoded: &str) -> Result<DecodedHash, PasswordHashError> {
    let fields: Vec<&str> = encoded.split('$').collect();
    if fields.len() != 6 || !fields[0].is_empty() || fields[1] != ALGORITHM_TAG {
        return Err(PasswordHashError::InvalidHashFormat);
    }

    let version = fields[2]
        .strip_prefix("v=")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or(PasswordHashError::MalformedField { field: "version" })?;
    if version != ARGON2_VERSION {
        return Err(PasswordHashError::IncompatibleVersion(version));
    }

    let (memory_cost_kib, iterations, parallelism) = parse_params(fields[3])
        .ok_or(PasswordHashError::MalformedField { field: "parameter" })?;

    let salt = STANDARD_NO_PAD
        .decode(fields[4])
        .map_err(|_| PasswordHashError::MalformedField { field: "salt" })?;
    let key = Zeroizing::new(
        STANDARD_NO_PAD
            .decode(fields[5])
            .map_err(|_| PasswordHashError::MalformedField { field: "key" })?,
    );

    Ok(DecodedHash {
        config: PasswordConfig {
            memory_cost_kib,
            iterations,
            parallelism,
            salt_length: salt.len(),
            key_length: key.len(),
        },
        salt,
        key,
    })
}

fn parse_params(field: &str) -> Option<(u32, u32, u32)> {
    let mut parts = field.split(',');
    let m = parts.next()?.strip_prefix("m=")?.parse().ok()?;
    let t = parts.next()?.strip_prefix("t=")?.parse().ok()?;
    let p = parts.next()?.strip_prefix("p=")?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((m, t, p))
}

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b-256 digest of `data` as lowercase hex.
pub fn blake256_hex(data: &[u8]) -> String {
    hex::encode(Blake2b256::digest(data))
}

/// Whether `expected_hex` is the BLAKE2b-256 digest of `data`. Hex case is
/// ignored; anything that is not 32 bytes of hex never matches.
pub fn verify_blake256(data: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    constant_time_eq(&Blake2b256::digest(data), &expected)
}

/// Password hashing bound to one configuration.
#[derive(Debug, Clone, Default)]
pub struct HashService {
    config: PasswordConfig,
}

impl HashService {
    /// Create a service using [`PasswordConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PasswordConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PasswordConfig {
        &self.config
    }

    /// Hash `password` with this service's configuration.
    pub fn create_password_hash(&self, password: &str) -> Result<String, PasswordHashError> {
        hash(&self.config, password)
    }

    /// Verify `password` against any hash this codec understands, whatever
    /// configuration produced it.
    pub fn compare_password_and_hash(
        &self,
        password: &str,
        encoded: &str,
    ) -> Result<(), PasswordHashError> {
        verify(password, encoded)
    }

    /// Hex BLAKE2b-256 digest of `data`.
    pub fn create_hash_blake256(&self, data: &[u8]) -> String {
        blake256_hex(data)
    }

    pub fn verify_hash_blake256(&self, data: &[u8], expected_hex: &str) -> bool {
        verify_blake256(data, expected_hex)
    }

    /// Random unique token (UUID v4, simple form).
    pub fn generate_token(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}
