//! Shared types for `sealkit` crates: the key-service boundary error and the
//! persisted data-key record format.

pub mod error;
pub mod protocol;

pub use error::{BoxError, WrapError};
pub use protocol::{DataKeyDocument, DataKeyEntry, EncryptionContext};
