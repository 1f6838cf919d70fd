//! Server configuration

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

/// Optional config file, looked up as `co2-monitor.{toml,json,yaml,...}`
pub const CONFIG_FILE: &str = "co2-monitor";

/// Prefix for environment overrides, e.g. `CO2_MONITOR_BIND_ADDR`
pub const ENV_PREFIX: &str = "CO2_MONITOR";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite URL (`sqlite://path/to.db`); in-memory store when unset
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Install the Prometheus recorder and serve `/metrics`
    #[serde(default)]
    pub prometheus: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            log_format: LogFormat::default(),
            log_level: default_log_level(),
            prometheus: false,
        }
    }
}

impl ServerConfig {
    /// Load from the optional config file, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder().add_source(File::with_name(CONFIG_FILE).required(false)),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> ServerConfig {
        ServerConfig::from_builder(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.database_url, None);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.log_level, "info");
        assert!(!config.prometheus);
    }

    #[test]
    fn test_file_values() {
        let config = from_toml(
            r#"
            bind_addr = "127.0.0.1:9000"
            database_url = "sqlite://data/co2.db"
            log_format = "json"
            prometheus = true
            "#,
        );
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.database_url.as_deref(), Some("sqlite://data/co2.db"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.prometheus);
    }
}
