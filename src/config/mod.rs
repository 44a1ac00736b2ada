//! Application configuration.
//!
//! Aggregates the per-module configuration sections into a single Config
//! struct loaded from YAML files and environment variables. The loaded value
//! is passed to constructors; nothing reads configuration globally.

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::engine::EngineConfig;
use crate::rpc::RpcConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "callcore.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CALLCORE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CALLCORE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CALLCORE_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "CALLCORE_LOG_FORMAT";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Request/reply.
    pub rpc: RpcConfig,
    /// Event engine.
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `callcore.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
