//! Errors raised at the key-service boundary.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by a concrete key-service client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a call to the external key-wrapping service.
///
/// The contents are opaque to callers: adapters wrap whatever their SDK
/// returned and the registry passes it through with added context, never
/// interpreting it.
#[derive(Debug, Error)]
pub enum WrapError {
    /// The service rejected or failed the request.
    #[error("key service request failed: {0}")]
    Service(#[source] BoxError),

    /// The call did not complete within the configured deadline.
    #[error("key service call timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered but the response is unusable
    /// (missing plaintext, unexpected key length, ...).
    #[error("malformed key service response: {0}")]
    MalformedResponse(String),

    /// The master key id is not known to the service.
    #[error("unknown master key: {0}")]
    UnknownMasterKey(String),
}

impl WrapError {
    /// Wrap an arbitrary client error.
    pub fn service<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Service(err.into())
    }
}
