//! Configuration loading and validation.
//!
//! All values are read from `SEALKIT_`-prefixed environment variables, e.g.
//! `SEALKIT_MASTER_KEY_ID`. Loading fails with a descriptive error if a
//! required variable is missing or a value is out of range.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::claims::ClaimsService;
use crate::dek::DataKeyRegistry;
use crate::kms::KeyWrapper;
use crate::password::PasswordConfig;

const ENV_PREFIX: &str = "SEALKIT";

/// Validated library configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Master key id passed to the key-wrapping service. **Required.**
    pub master_key_id: String,

    /// Override for the KMS endpoint (local emulator or proxy).
    #[serde(default)]
    pub kms_endpoint_url: Option<String>,

    /// Per-call timeout for key-wrapping service requests.
    #[serde(default = "default_key_service_timeout_ms")]
    pub key_service_timeout_ms: u64,

    #[serde(default = "default_argon_memory_kib")]
    pub argon_memory_kib: u32,

    #[serde(default = "default_argon_iterations")]
    pub argon_iterations: u32,

    #[serde(default = "default_argon_parallelism")]
    pub argon_parallelism: u32,

    #[serde(default = "default_argon_salt_length")]
    pub argon_salt_length: usize,

    #[serde(default = "default_argon_key_length")]
    pub argon_key_length: usize,

    /// Hex Ed25519 private key (seed or keypair form). Set together with
    /// `claims_public_key_hex` or not at all.
    #[serde(default)]
    pub claims_private_key_hex: Option<String>,

    #[serde(default)]
    pub claims_public_key_hex: Option<String>,

    /// Clock skew tolerated when checking token validity windows.
    #[serde(default)]
    pub claims_leeway_secs: u64,

    /// OTLP collector endpoint. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_service_timeout_ms() -> u64 {
    5_000
}
fn default_argon_memory_kib() -> u32 {
    32 * 1024
}
fn default_argon_iterations() -> u32 {
    3
}
fn default_argon_parallelism() -> u32 {
    1
}
fn default_argon_salt_length() -> usize {
    16
}
fn default_argon_key_length() -> usize {
    32
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent, cannot be parsed,
    /// or fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_env_prefix(ENV_PREFIX)
    }

    fn from_env_prefix(prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix))
            .build()
            .context("failed to build configuration from environment")?;

        let mut c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.normalise();
        c.validate()?;
        Ok(c)
    }

    /// Treat blank optional values as unset.
    fn normalise(&mut self) {
        for field in [
            &mut self.kms_endpoint_url,
            &mut self.claims_private_key_hex,
            &mut self.claims_public_key_hex,
            &mut self.otel_exporter_otlp_endpoint,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.master_key_id.trim().is_empty() {
            anyhow::bail!("{ENV_PREFIX}_MASTER_KEY_ID is required and must not be empty");
        }
        if self.key_service_timeout_ms == 0 {
            anyhow::bail!("{ENV_PREFIX}_KEY_SERVICE_TIMEOUT_MS must be > 0");
        }
        if self.argon_iterations == 0 {
            anyhow::bail!("{ENV_PREFIX}_ARGON_ITERATIONS must be > 0");
        }
        if self.argon_parallelism == 0 {
            anyhow::bail!("{ENV_PREFIX}_ARGON_PARALLELISM must be > 0");
        }
        if self.argon_memory_kib < self.argon_parallelism.saturating_mul(8) {
            anyhow::bail!(
                "{ENV_PREFIX}_ARGON_MEMORY_KIB must be at least 8 KiB per lane ({})",
                self.argon_parallelism.saturating_mul(8)
            );
        }
        if self.argon_salt_length < 8 {
            anyhow::bail!("{ENV_PREFIX}_ARGON_SALT_LENGTH must be >= 8");
        }
        if self.argon_key_length < 16 {
            anyhow::bail!("{ENV_PREFIX}_ARGON_KEY_LENGTH must be >= 16");
        }
        if self.claims_private_key_hex.is_some() != self.claims_public_key_hex.is_some() {
            anyhow::bail!(
                "{ENV_PREFIX}_CLAIMS_PRIVATE_KEY_HEX and {ENV_PREFIX}_CLAIMS_PUBLIC_KEY_HEX must be set together"
            );
        }
        self.claims_service()?;
        Ok(())
    }

    pub fn key_service_timeout(&self) -> Duration {
        Duration::from_millis(self.key_service_timeout_ms)
    }

    pub fn password_config(&self) -> PasswordConfig {
        PasswordConfig {
            memory_cost_kib: self.argon_memory_kib,
            iterations: self.argon_iterations,
            parallelism: self.argon_parallelism,
            salt_length: self.argon_salt_length,
            key_length: self.argon_key_length,
        }
    }

    /// Build the claims service from the configured key pair, or `None` when
    /// no keys are configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the key material is malformed.
    pub fn claims_service(&self) -> Result<Option<ClaimsService>> {
        let (Some(private), Some(public)) =
            (&self.claims_private_key_hex, &self.claims_public_key_hex)
        else {
            return Ok(None);
        };
        let service = ClaimsService::from_hex(private, public)
            .context("invalid claims signing key pair")?
            .with_leeway(Duration::from_secs(self.claims_leeway_secs));
        Ok(Some(service))
    }

    /// Build a registry bound to the configured master key and call timeout.
    pub fn build_registry(&self, wrapper: Arc<dyn KeyWrapper>) -> DataKeyRegistry {
        DataKeyRegistry::new(wrapper, self.master_key_id.clone())
            .with_call_timeout(self.key_service_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKeyWrapper;

    fn base() -> Config {
        Config {
            master_key_id: "alias/sealkit".into(),
            kms_endpoint_url: None,
            key_service_timeout_ms: default_key_service_timeout_ms(),
            argon_memory_kib: default_argon_memory_kib(),
            argon_iterations: default_argon_iterations(),
            argon_parallelism: default_argon_parallelism(),
            argon_salt_length: default_argon_salt_length(),
            argon_key_length: default_argon_key_length(),
            claims_private_key_hex: None,
            claims_public_key_hex: None,
            claims_leeway_secs: 0,
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_key_service_timeout_ms(), 5_000);
        assert_eq!(base().password_config(), PasswordConfig::default());
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn loads_from_prefixed_environment() {
        std::env::set_var("SKTEST_LOAD_MASTER_KEY_ID", "mk-1");
        std::env::set_var("SKTEST_LOAD_KEY_SERVICE_TIMEOUT_MS", "250");
        std::env::set_var("SKTEST_LOAD_ARGON_ITERATIONS", "4");
        std::env::set_var("SKTEST_LOAD_OTEL_EXPORTER_OTLP_ENDPOINT", "");

        let cfg = Config::from_env_prefix("SKTEST_LOAD").unwrap();
        assert_eq!(cfg.master_key_id, "mk-1");
        assert_eq!(cfg.key_service_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.password_config().iterations, 4);
        assert_eq!(cfg.argon_memory_kib, 32 * 1024);
        assert!(cfg.otel_exporter_otlp_endpoint.is_none());
        assert!(cfg.claims_service().unwrap().is_none());
    }

    #[test]
    fn missing_master_key_id_fails() {
        std::env::set_var("SKTEST_MISSING_LOG_LEVEL", "debug");
        assert!(Config::from_env_prefix("SKTEST_MISSING").is_err());
    }

    #[test]
    fn validate_rejects_empty_master_key_id() {
        let cfg = Config {
            master_key_id: "  ".into(),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let cfg = Config {
            key_service_timeout_ms: 0,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_weak_argon_parameters() {
        for cfg in [
            Config { argon_salt_length: 4, ..base() },
            Config { argon_key_length: 8, ..base() },
            Config { argon_iterations: 0, ..base() },
            Config { argon_parallelism: 0, ..base() },
            Config { argon_memory_kib: 4, ..base() },
        ] {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn claims_keys_must_come_in_pairs() {
        let cfg = Config {
            claims_public_key_hex: Some("00".repeat(32)),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_claims_keys_fail_validation() {
        let cfg = Config {
            claims_private_key_hex: Some("abcd".into()),
            claims_public_key_hex: Some("abcd".into()),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn claims_service_built_from_hex_pair() {
        let generated = ClaimsService::generate();
        let token = generated
            .issue_for(Default::default(), Duration::from_secs(60))
            .unwrap();

        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let cfg = Config {
            claims_private_key_hex: Some(hex::encode(signing.to_bytes())),
            claims_public_key_hex: Some(hex::encode(signing.verifying_key().as_bytes())),
            claims_leeway_secs: 10,
            ..base()
        };
        cfg.validate().unwrap();
        let svc = cfg.claims_service().unwrap().unwrap();
        assert_eq!(svc.public_key_hex(), hex::encode(signing.verifying_key().as_bytes()));
        assert!(svc.verify(&token).is_err());
    }

    #[tokio::test]
    async fn build_registry_uses_master_key_id() {
        let cfg = Config {
            master_key_id: "mk".into(),
            ..base()
        };
        let wrapper = Arc::new(LocalKeyWrapper::new().with_random_master_key("mk"));
        let registry = cfg.build_registry(wrapper);
        assert_eq!(registry.master_key_id(), "mk");
        registry.create_data_key("t").await.unwrap();
        assert!(registry.fetch_data_key("t").await.is_ok());
    }
}
