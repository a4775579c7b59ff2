//! `sealkit`: tenant envelope encryption, Argon2id password hashing and
//! Ed25519-signed claim tokens.
//!
//! Typical wiring:
//! 1. Load and validate [`Config`] from `SEALKIT_*` environment variables.
//! 2. Initialise logging with [`telemetry::init_telemetry`].
//! 3. Build a [`KeyWrapper`] ([`AwsKms`] or [`LocalKeyWrapper`]) and a
//!    [`DataKeyRegistry`] from it with [`Config::build_registry`].
//! 4. Wrap the registry in an [`EnvelopeService`] for payload encryption.
//! 5. Build a [`HashService`] from [`Config::password_config`] and, when keys
//!    are configured, a [`ClaimsService`] from [`Config::claims_service`].

pub mod claims;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dek;
pub mod envelope;
pub mod kms;
pub mod password;
pub mod telemetry;

pub use claims::{ClaimSet, ClaimsError, ClaimsService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use crypto::CipherError;
pub use dek::{DataKeyRecord, DataKeyRegistry, DekBytes, RegistryError};
pub use envelope::{EnvelopeError, EnvelopeService};
pub use kms::{AwsKms, GeneratedDataKey, KeyWrapper, LocalKeyWrapper};
pub use password::{HashService, PasswordConfig, PasswordHashError};

pub use common::{DataKeyDocument, DataKeyEntry, EncryptionContext, WrapError};
