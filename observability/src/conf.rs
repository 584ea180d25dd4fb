use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};
use typed_builder::TypedBuilder;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";

lazy_static::lazy_static! {
    pub(crate) static ref ENVIRONMENT: ExecutionEnvironment = mode();
}

/// Telemetry settings shared by every crate in the workspace.
///
/// Every field is optional so that an empty `[telemetry]` table in a
/// configuration file is accepted.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, TypedBuilder, Validate)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// The service name, used as the default tracing target prefix in logs.
    #[builder(default, setter(strip_option, into))]
    #[validate(length(min = 1))]
    tracing_service_name: Option<String>,

    /// Log level directive used when `RUST_LOG` is not set, e.g. `"info"`
    /// or `"fhevm_session=debug,info"`.
    #[builder(default, setter(strip_option, into))]
    #[validate(length(min = 1))]
    log_level: Option<String>,

    /// If this is set, console logs are emitted as json.
    #[builder(default, setter(strip_option))]
    json_logs: Option<bool>,

    /// Optional file that receives a json copy of every log line.
    #[builder(default, setter(strip_option))]
    log_file: Option<PathBuf>,
}

impl TelemetryConfig {
    /// Returns the service name.
    pub fn tracing_service_name(&self) -> Option<&str> {
        self.tracing_service_name.as_deref()
    }

    /// Returns the log level directive, defaulting to `info`.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Returns whether console logs are json.
    pub fn json_logs(&self) -> bool {
        self.json_logs.unwrap_or(false)
    }

    /// Returns the optional log file.
    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

#[derive(
    Default, Display, Deserialize, Serialize, Clone, EnumString, AsRefStr, Eq, PartialEq, Debug,
)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionEnvironment {
    #[default]
    Local,
    #[strum(serialize = "dev")]
    Development,
    Stage,
    #[strum(serialize = "prod")]
    Production,
    Integration,
}

#[derive(TypedBuilder, Debug)]
pub struct Settings<'a> {
    #[builder(setter(strip_option), default = None)]
    path: Option<&'a str>,
    env_prefix: &'a str,
}

fn mode() -> ExecutionEnvironment {
    env::var("RUN_MODE")
        .map(|enum_str| ExecutionEnvironment::from_str(enum_str.as_str()).unwrap_or_default())
        .unwrap_or_else(|_| ExecutionEnvironment::Local)
}

impl Settings<'_> {
    /// Loads and deserializes a layered configuration.
    ///
    /// Sources, from lowest to highest priority: `config/default`,
    /// `config/<prefix>`, `config/<prefix>-<RUN_MODE>`, the explicit path
    /// (required if given) and finally environment variables
    /// `<PREFIX>__SECTION__KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be created or deserialized.
    pub fn init_conf<'de, T: Deserialize<'de> + std::fmt::Debug>(&self) -> Result<T, ConfigError> {
        let env_conf = config::Environment::default()
            .prefix(self.env_prefix)
            .separator("__");
        let mut config_builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                File::with_name(&format!("config/{}", self.env_prefix.to_lowercase()))
                    .required(false),
            )
            .add_source(
                File::with_name(&format!(
                    "config/{}-{}",
                    self.env_prefix.to_lowercase(),
                    *ENVIRONMENT
                ))
                .required(false),
            );

        if let Some(path) = self.path {
            config_builder = config_builder.add_source(File::with_name(path).required(true))
        };

        let config = config_builder.add_source(env_conf).build()?;

        let settings: T = config.try_deserialize()?;

        tracing::debug!("loaded settings: {:?}", settings);

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        telemetry: TelemetryConfig,
        answer: u64,
    }

    #[test]
    fn defaults_apply_on_empty_telemetry() {
        let conf = TelemetryConfig::builder().build();
        assert_eq!(conf.log_level(), "info");
        assert!(!conf.json_logs());
        assert!(conf.tracing_service_name().is_none());
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let conf = TelemetryConfig::builder().tracing_service_name("").build();
        assert!(conf.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "answer = 41\n[telemetry]\ntracing_service_name = \"svc\"\njson_logs = true"
        )
        .unwrap();
        std::env::set_var("OBSTEST__ANSWER", "42");

        let path = file.path().to_str().unwrap().to_string();
        let sample: Sample = Settings::builder()
            .path(path.as_str())
            .env_prefix("OBSTEST")
            .build()
            .init_conf()
            .unwrap();
        std::env::remove_var("OBSTEST__ANSWER");

        assert_eq!(sample.answer, 42);
        assert_eq!(sample.telemetry.tracing_service_name(), Some("svc"));
        assert!(sample.telemetry.json_logs());
    }
}
