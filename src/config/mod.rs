//! Configuration.
//!
//! Loaded with the `config` crate from YAML files and `MEDIATX__*`
//! environment variables.

mod messaging;

pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};

use serde::Deserialize;

use crate::routing::RoutingConfig;
use crate::transport::TransportConfig;

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MEDIATX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MEDIATX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MEDIATX_LOG";
/// Default config file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "mediatx";

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker selection and connection settings.
    pub messaging: MessagingConfig,
    /// Exchange, queue naming and serializer options.
    pub transport: TransportConfig,
    /// Route key overrides.
    pub routing: RoutingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `mediatx.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `MEDIATX__TRANSPORT__EXCHANGE`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Create config for testing: in-memory broker, default names.
    pub fn for_test() -> Self {
        Self::default()
    }
}
