//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/hwctl.toml` by default)
//! 2. Environment variables prefixed with `HWCTL_`, nested keys split on `__`
//!
//! Every section has defaults, so a file may contain only `[[instruments]]`.
//!
//! # Example
//! ```no_run
//! use rust_hwctl::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // HWCTL_REMOTE__HANDSHAKE_PORT=6000 overrides remote.handshake_port
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use crate::error::{HwError, HwResult};
use crate::instrument::config::InstrumentDefinition;
use crate::logging::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/hwctl.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HWCTL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Remote proxy endpoints and session loop tuning
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Remote proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Interface the exposer binds
    pub host: String,
    /// Fixed handshake port of the exposer
    pub handshake_port: u16,
    /// Publish port (0 = pick a free port)
    pub publish_port: u16,
    /// Bound on every handshake request, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Pause between session loop iterations, in milliseconds
    pub loop_interval_ms: u64,
    /// Reconnect and announce the online state every this many iterations
    pub reconnect_every: u64,
    /// Messages taken from the subscription per drain
    pub max_batch: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            handshake_port: 5555,
            publish_port: 0,
            handshake_timeout_ms: 5000,
            loop_interval_ms: 10,
            reconnect_every: 100,
            max_batch: 100,
        }
    }
}

impl RemoteConfig {
    /// `host:handshake_port`
    pub fn handshake_address(&self) -> String {
        format!("{}:{}", self.host, self.handshake_port)
    }

    /// `host:publish_port`
    pub fn publish_address(&self) -> String {
        format!("{}:{}", self.host, self.publish_port)
    }

    /// Deadline for a handshake reply.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Sleep between idle session iterations.
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }
}

// Default value functions
fn default_name() -> String {
    "hwctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix HWCTL_
    /// Example: HWCTL_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> HwResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> HwResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> HwResult<Self> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Provider stack used by [`load_from`](Self::load_from)
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HwResult<()> {
        parse_log_level(&self.application.log_level)?;

        let remote = &self.remote;
        if remote.handshake_timeout_ms == 0 {
            return Err(HwError::Configuration(
                "remote.handshake_timeout_ms must be greater than 0".into(),
            ));
        }
        if remote.reconnect_every == 0 {
            return Err(HwError::Configuration(
                "remote.reconnect_every must be greater than 0".into(),
            ));
        }
        if remote.max_batch == 0 {
            return Err(HwError::Configuration(
                "remote.max_batch must be greater than 0".into(),
            ));
        }

        // Instrument names are also data channel topics
        let mut names = HashSet::new();
        for instrument in &self.instruments {
            if !names.insert(instrument.name.as_str()) {
                return Err(HwError::Configuration(format!(
                    "Duplicate instrument name: {}",
                    instrument.name
                )));
            }
            instrument.validate()?;
        }

        Ok(())
    }

    /// Look up an instrument definition by name
    pub fn instrument(&self, name: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|i| i.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const SAMPLE: &str = r#"
        [application]
        name = "Bench"
        log_level = "debug"
        log_format = "json"

        [remote]
        handshake_port = 6100

        [[instruments]]
        name = "PSU"
        address = "127.0.0.1:5025"

        [[instruments]]
        name = "SIM"
        dummy = true
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Bench");
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.remote.handshake_port, 6100);
        assert_eq!(config.remote.publish_port, 0);
        assert_eq!(config.remote.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.instrument("SIM").map(|i| i.address.as_str()), Some("None"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(HwError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_instrument_names() {
        let mut config = AppConfig::default();
        config.instruments = vec![
            InstrumentDefinition::new("PSU", "None"),
            InstrumentDefinition::new("PSU", "10.0.0.1:5025"),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument name: PSU"));
    }

    #[test]
    fn test_zero_reconnect_interval_rejected() {
        let mut config = AppConfig::default();
        config.remote.reconnect_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("hwctl.toml", SAMPLE)?;
            jail.set_env("HWCTL_REMOTE__HANDSHAKE_PORT", "7000");
            jail.set_env("HWCTL_APPLICATION__LOG_LEVEL", "warn");

            let config = AppConfig::load_from("hwctl.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.remote.handshake_port, 7000);
            assert_eq!(config.application.log_level, "warn");
            assert_eq!(config.application.name, "Bench");
            Ok(())
        });
    }
}
