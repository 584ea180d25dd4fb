use crate::consts::{
    CONF_ENV_PREFIX, DEFAULT_DURATION_DAYS, DEFAULT_RELAYER_RETRY_MAX_ITER,
    DEFAULT_RELAYER_RETRY_SLEEP_MS, DEFAULT_RELAYER_TIMEOUT_SECS, DEFAULT_SIGNATURE_STORAGE_PREFIX,
    MAX_DURATION_DAYS,
};
use crate::error::SessionError;
use crate::registry::{ChainConfig, ChainRegistry};
use observability::conf::{Settings, TelemetryConfig};
use observability::telemetry::init_tracing;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Full configuration of a session manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_session_config))]
pub struct SessionConfig {
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: Option<TelemetryConfig>,
    /// Registered chains. When empty, the built-in chains are used.
    #[serde(default)]
    #[validate(nested)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    #[validate(nested)]
    pub relayer: RelayerConnConfig,
}

fn validate_session_config(conf: &SessionConfig) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for chain in &conf.chains {
        if !seen.insert(chain.chain_id) {
            return Err(ValidationError::new("Duplicate Chain").with_message(
                format!("Chain id {} is configured more than once.", chain.chain_id).into(),
            ));
        }
    }
    Ok(())
}

impl SessionConfig {
    pub fn registry(&self) -> Result<ChainRegistry, SessionError> {
        if self.chains.is_empty() {
            Ok(ChainRegistry::with_defaults())
        } else {
            ChainRegistry::new(self.chains.clone())
        }
    }
}

/// Settings of the decryption authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationConfig {
    /// Validity window of newly signed authorizations, in days.
    #[serde(default = "default_duration_days")]
    #[validate(range(min = 1, max = MAX_DURATION_DAYS))]
    pub duration_days: u64,
    /// Prefix of the keys written to the store.
    #[serde(default = "default_storage_prefix")]
    #[validate(length(min = 1))]
    pub storage_prefix: String,
}

fn default_duration_days() -> u64 {
    DEFAULT_DURATION_DAYS
}

fn default_storage_prefix() -> String {
    DEFAULT_SIGNATURE_STORAGE_PREFIX.to_string()
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            duration_days: default_duration_days(),
            storage_prefix: default_storage_prefix(),
        }
    }
}

/// Settings of the HTTP client talking to a live relayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RelayerConnConfig {
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,
    #[serde(default = "default_retry_max_iter")]
    pub retry_max_iter: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_RELAYER_TIMEOUT_SECS
}

fn default_retry_sleep_ms() -> u64 {
    DEFAULT_RELAYER_RETRY_SLEEP_MS
}

fn default_retry_max_iter() -> u64 {
    DEFAULT_RELAYER_RETRY_MAX_ITER
}

impl Default for RelayerConnConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_sleep_ms: default_retry_sleep_ms(),
            retry_max_iter: default_retry_max_iter(),
        }
    }
}

impl RelayerConnConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Initialize the configuration from the given file.
pub fn init_conf<'a, T: Deserialize<'a> + std::fmt::Debug>(config_file: &str) -> anyhow::Result<T> {
    Settings::builder()
        .path(config_file)
        .env_prefix(CONF_ENV_PREFIX)
        .build()
        .init_conf()
        .map_err(|e| e.into())
}

/// Initialize and validate the configuration from the given file and initialize tracing.
pub fn init_conf_with_telemetry(config_file: &str) -> anyhow::Result<SessionConfig> {
    let full_config: SessionConfig = init_conf(config_file)?;
    full_config.validate()?;
    let telemetry = full_config.telemetry.clone().unwrap_or_else(|| {
        TelemetryConfig::builder()
            .tracing_service_name("fhevm_session".to_string())
            .build()
    });
    init_tracing(&telemetry)?;
    Ok(full_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HARDHAT_CHAIN_ID;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let conf = SessionConfig::default();
        assert!(conf.validate().is_ok());
        assert_eq!(conf.authorization.duration_days, 1);
        assert_eq!(conf.registry().unwrap(), ChainRegistry::with_defaults());
    }

    #[test]
    fn duration_is_bounded() {
        let mut conf = SessionConfig::default();
        conf.authorization.duration_days = 0;
        assert!(conf.validate().is_err());
        conf.authorization.duration_days = 366;
        assert!(conf.validate().is_err());
        conf.authorization.duration_days = 365;
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn duplicate_chains_are_rejected() {
        let conf = SessionConfig {
            chains: vec![ChainConfig::hardhat(), ChainConfig::hardhat()],
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let hardhat = ChainConfig::hardhat();
        writeln!(
            file,
            r#"
[authorization]
duration_days = 7

[relayer]
timeout_secs = 5

[[chains]]
chain_id = {}
name = "local"
mode = "mock"
gateway_chain_id = 55815
acl_contract_address = "{}"
kms_contract_address = "{}"
input_verifier_contract_address = "{}"
verifying_contract_address_decryption = "{}"
verifying_contract_address_input_verification = "{}"
"#,
            HARDHAT_CHAIN_ID,
            hardhat.acl_contract_address,
            hardhat.kms_contract_address,
            hardhat.input_verifier_contract_address,
            hardhat.verifying_contract_address_decryption,
            hardhat.verifying_contract_address_input_verification,
        )
        .unwrap();
        std::env::set_var("FHEVM_SESSION__AUTHORIZATION__STORAGE_PREFIX", "custom-decsig");

        let conf: SessionConfig = init_conf(file.path().to_str().unwrap()).unwrap();
        std::env::remove_var("FHEVM_SESSION__AUTHORIZATION__STORAGE_PREFIX");

        assert!(conf.validate().is_ok());
        assert_eq!(conf.authorization.duration_days, 7);
        assert_eq!(conf.authorization.storage_prefix, "custom-decsig");
        assert_eq!(conf.relayer.timeout(), Duration::from_secs(5));
        assert_eq!(conf.relayer.retry_max_iter, DEFAULT_RELAYER_RETRY_MAX_ITER);
        let registry = conf.registry().unwrap();
        let chain = registry.lookup(HARDHAT_CHAIN_ID).unwrap();
        assert_eq!(chain.name, "local");
        assert_eq!(chain.acl_contract_address, hardhat.acl_contract_address);
        assert!(chain.relayer_url.is_none());
    }
}
