//! AWS KMS implementation of [`KeyWrapper`].

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::{error::DisplayErrorContext, primitives::Blob, types::DataKeySpec};
use common::{EncryptionContext, WrapError};
use zeroize::Zeroizing;

use super::{GeneratedDataKey, KeyWrapper};

/// KMS client wrapper. Cheap to clone; clones share the underlying
/// connection pool.
#[derive(Clone, Debug)]
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    pub fn new(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS configuration chain
    /// (environment, profile, instance role).
    ///
    /// `endpoint_url` overrides the service endpoint, e.g. for a local KMS
    /// emulator or a proxy.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible so credential preflight can be
    /// added without an API change.
    pub async fn from_env(endpoint_url: Option<&str>) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut builder = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        Ok(Self::new(aws_sdk_kms::Client::from_conf(builder.build())))
    }
}

fn sdk_context(context: &EncryptionContext) -> Option<HashMap<String, String>> {
    if context.is_empty() {
        return None;
    }
    Some(context.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[async_trait]
impl KeyWrapper for AwsKms {
    async fn wrap_key(
        &self,
        master_key_id: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Vec<u8>, WrapError> {
        let resp = self
            .client
            .encrypt()
            .key_id(master_key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .set_encryption_context(sdk_context(context))
            .send()
            .await
            .map_err(|e| WrapError::service(DisplayErrorContext(e).to_string()))?;

        resp.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| WrapError::MalformedResponse("encrypt returned no ciphertext".into()))
    }

    async fn unwrap_key(
        &self,
        master_key_id: &str,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, WrapError> {
        let resp = self
            .client
            .decrypt()
            .key_id(master_key_id)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .set_encryption_context(sdk_context(context))
            .send()
            .await
            .map_err(|e| WrapError::service(DisplayErrorContext(e).to_string()))?;

        resp.plaintext()
            .map(|b| Zeroizing::new(b.as_ref().to_vec()))
            .ok_or_else(|| WrapError::MalformedResponse("decrypt returned no plaintext".into()))
    }

    async fn generate_data_key(
        &self,
        master_key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, WrapError> {
        let resp = self
            .client
            .generate_data_key()
            .key_id(master_key_id)
            .key_spec(DataKeySpec::Aes256)
            .set_encryption_context(sdk_context(context))
            .send()
            .await
            .map_err(|e| WrapError::service(DisplayErrorContext(e).to_string()))?;

        let plaintext = resp
            .plaintext()
            .map(|b| Zeroizing::new(b.as_ref().to_vec()))
            .ok_or_else(|| {
                WrapError::MalformedResponse("generate_data_key returned no plaintext".into())
            })?;
        let wrapped = resp
            .ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| {
                WrapError::MalformedResponse("generate_data_key returned no ciphertext".into())
            })?;

        Ok(GeneratedDataKey { plaintext, wrapped })
    }
}
