//! Ed25519-signed, time-bounded claim tokens.
//!
//! Tokens use the compact JWS layout `header.claims.signature`, each segment
//! base64url without padding, with `{"alg":"EdDSA","typ":"JWT"}` as header.
//! Issuance adds `iat`, `exp` and a random `nonce` to the caller's claims.
//! Verification checks, in order: structure, algorithm, signature, then the
//! validity window. A token with a bad signature is never reported as expired.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

/// The only accepted `alg` header value.
pub const ALGORITHM: &str = "EdDSA";

pub const CLAIM_EXPIRES_AT: &str = "exp";
pub const CLAIM_ISSUED_AT: &str = "iat";
pub const CLAIM_NOT_BEFORE: &str = "nbf";
pub const CLAIM_NONCE: &str = "nonce";

/// Claim names and values carried by a token.
pub type ClaimSet = Map<String, Value>;

/// Errors produced by the claims service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("invalid signing method: {0}")]
    InvalidSigningMethod(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token has expired")]
    TokenExpired,

    #[error("token not valid yet")]
    TokenNotValidYet,

    /// Raw key material of the wrong size.
    #[error("bad ed25519 {kind} key size: {len} bytes")]
    BadKeySize { kind: &'static str, len: usize },

    /// Key material that is not hex, or not a valid curve point.
    #[error("invalid ed25519 {0} key")]
    InvalidKey(&'static str),

    #[error("failed to encode token: {0}")]
    Encoding(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Issues and verifies claim tokens with a fixed Ed25519 key pair.
///
/// Holds only immutable key material after construction; share it freely
/// across threads.
#[derive(Clone)]
pub struct ClaimsService {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    clock: Arc<dyn Clock>,
    leeway_secs: i64,
}

impl std::fmt::Debug for ClaimsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsService")
            .field("public_key", &self.public_key_hex())
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl ClaimsService {
    /// Build from raw key bytes.
    ///
    /// `private_key` is either a 32-byte seed or the 64-byte `seed || public`
    /// keypair form; `public_key` is 32 bytes.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::BadKeySize`] for wrong lengths, [`ClaimsError::InvalidKey`]
    /// if the public key is not a valid point or the keypair halves disagree.
    pub fn new(private_key: &[u8], public_key: &[u8]) -> Result<Self, ClaimsError> {
        let signing_key = match private_key.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(private_key);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut pair = [0u8; 64];
                pair.copy_from_slice(private_key);
                SigningKey::from_keypair_bytes(&pair)
                    .map_err(|_| ClaimsError::InvalidKey("private"))?
            }
            len => {
                return Err(ClaimsError::BadKeySize {
                    kind: "private",
                    len,
                })
            }
        };

        let public: [u8; 32] = public_key.try_into().map_err(|_| ClaimsError::BadKeySize {
            kind: "public",
            len: public_key.len(),
        })?;
        let verifying_key =
            VerifyingKey::from_bytes(&public).map_err(|_| ClaimsError::InvalidKey("public"))?;

        Ok(Self::from_keys(signing_key, verifying_key))
    }

    /// Build from hex-encoded key material.
    pub fn from_hex(private_hex: &str, public_hex: &str) -> Result<Self, ClaimsError> {
        let private = hex::decode(private_hex.trim()).map_err(|_| ClaimsError::InvalidKey("private"))?;
        let public = hex::decode(public_hex.trim()).map_err(|_| ClaimsError::InvalidKey("public"))?;
        Self::new(&private, &public)
    }

    /// Build with a freshly generated key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self::from_keys(signing_key, verifying_key)
    }

    fn from_keys(signing_key: SigningKey, verifying_key: VerifyingKey) -> Self {
        Self {
            signing_key,
            verifying_key,
            clock: Arc::new(SystemClock),
            leeway_secs: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tolerance applied to `exp`, `nbf` and `iat` checks.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_secs = i64::try_from(leeway.as_secs()).unwrap_or(i64::MAX);
        self
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Sign `claims` with an expiry of `expires_at`.
    ///
    /// `iat`, `exp` and `nonce` are set by the service and override any
    /// caller-supplied values of the same name.
    pub fn issue(&self, mut claims: ClaimSet, expires_at: DateTime<Utc>) -> Result<String, ClaimsError> {
        claims.insert(CLAIM_ISSUED_AT.into(), self.clock.now().timestamp().into());
        claims.insert(CLAIM_EXPIRES_AT.into(), expires_at.timestamp().into());
        claims.insert(
            CLAIM_NONCE.into(),
            uuid::Uuid::new_v4().simple().to_string().into(),
        );

        let header = Header {
            alg: ALGORITHM.into(),
            typ: Some("JWT".into()),
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| ClaimsError::Encoding(e.to_string()))?;
        let claims_json =
            serde_json::to_vec(&claims).map_err(|e| ClaimsError::Encoding(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// [`issue`](Self::issue) with an expiry `ttl` from now.
    pub fn issue_for(&self, claims: ClaimSet, ttl: Duration) -> Result<String, ClaimsError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| ClaimsError::Encoding(e.to_string()))?;
        self.issue(claims, self.clock.now() + ttl)
    }

    /// Verify `token` and return its full claim set.
    pub fn verify(&self, token: &str) -> Result<ClaimSet, ClaimsError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, claims_b64, signature_b64] = parts.as_slice() else {
            return Err(ClaimsError::InvalidTokenFormat);
        };

        let header: Header = decode_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(ClaimsError::InvalidSigningMethod(header.alg));
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| ClaimsError::InvalidTokenFormat)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| ClaimsError::InvalidSignature)?;
        let signing_input_len = header_b64.len() + 1 + claims_b64.len();
        self.verifying_key
            .verify_strict(&token.as_bytes()[..signing_input_len], &signature)
            .map_err(|_| ClaimsError::InvalidSignature)?;

        let claims: ClaimSet = decode_json(claims_b64)?;
        self.check_window(&claims)?;
        Ok(claims)
    }

    fn check_window(&self, claims: &ClaimSet) -> Result<(), ClaimsError> {
        let now = self.clock.now().timestamp();

        if let Some(exp) = numeric_claim(claims, CLAIM_EXPIRES_AT)? {
            if now >= exp.saturating_add(self.leeway_secs) {
                return Err(ClaimsError::TokenExpired);
            }
        }
        for name in [CLAIM_NOT_BEFORE, CLAIM_ISSUED_AT] {
            if let Some(at) = numeric_claim(claims, name)? {
                if now.saturating_add(self.leeway_secs) < at {
                    return Err(ClaimsError::TokenNotValidYet);
                }
            }
        }
        Ok(())
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, ClaimsError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| ClaimsError::InvalidTokenFormat)?;
    serde_json::from_slice(&bytes).map_err(|_| ClaimsError::InvalidTokenFormat)
}

/// Read a NumericDate claim; fractional seconds are truncated.
fn numeric_claim(claims: &ClaimSet, name: &str) -> Result<Option<i64>, ClaimsError> {
    match claims.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(ClaimsError::InvalidTokenFormat),
    }
}
