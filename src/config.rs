//! Driver configuration using Figment.
//!
//! Configuration is merged from, lowest precedence first:
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables prefixed with `DAQ_FEATURES_`
//!
//! ```text
//! DAQ_FEATURES_CACHING_ALLOWED=false
//! DAQ_FEATURES_DEFAULT_RETRIES=2
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_features::config::DriverConfig;
//!
//! fn main() -> daq_features::DaqResult<()> {
//!     let config = DriverConfig::load_from("config/driver.toml")?;
//!     println!("retries: {}", config.default_retries);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

/// Prefix of the environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "DAQ_FEATURES_";

/// Per-driver runtime options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Enable the feature cache.
    #[serde(default = "default_true")]
    pub caching_allowed: bool,
    /// Initial `unit_return` setting of unit bearing features and actions.
    #[serde(default = "default_true")]
    pub unit_return: bool,
    /// Retries of features and actions that do not declare their own.
    #[serde(default)]
    pub default_retries: u32,
    /// Pause after reopening a connection, in milliseconds.
    #[serde(default)]
    pub reopen_delay_ms: u64,
    /// Initial `inter_set_delay` setting of every feature, in milliseconds.
    #[serde(default)]
    pub inter_set_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            caching_allowed: true,
            unit_return: true,
            default_retries: 0,
            reopen_delay_ms: 0,
            inter_set_delay_ms: 0,
        }
    }
}

/// Upper bound on retries; anything larger is a configuration mistake.
const MAX_RETRIES: u32 = 100;

impl DriverConfig {
    /// Defaults overridden by the environment only.
    pub fn load() -> DaqResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(DriverConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the TOML file at `path`, then the environment.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Config` if the file cannot be parsed and
    /// `DaqError::Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(DriverConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out of range values.
    pub fn validate(&self) -> DaqResult<()> {
        if self.default_retries > MAX_RETRIES {
            return Err(DaqError::Configuration(format!(
                "default_retries {} exceeds {MAX_RETRIES}",
                self.default_retries
            )));
        }
        Ok(())
    }

    /// Pause before reopening a connection.
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    /// Render as a TOML document accepted by [`DriverConfig::load_from`].
    pub fn to_toml(&self) -> DaqResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("failed to serialize configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert!(config.caching_allowed);
        assert!(config.unit_return);
        assert_eq!(config.default_retries, 0);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "caching_allowed = false\ndefault_retries = 3").unwrap();
        let config = DriverConfig::load_from(file.path()).unwrap();
        assert!(!config.caching_allowed);
        assert_eq!(config.default_retries, 3);
        assert!(config.unit_return);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "default_retries = 3").unwrap();
        std::env::set_var("DAQ_FEATURES_DEFAULT_RETRIES", "5");
        let config = DriverConfig::load_from(file.path());
        std::env::remove_var("DAQ_FEATURES_DEFAULT_RETRIES");
        assert_eq!(config.unwrap().default_retries, 5);
    }

    #[test]
    #[serial]
    fn test_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "default_retries = 1000").unwrap();
        let err = DriverConfig::load_from(file.path()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    #[serial]
    fn test_toml_round_trip() {
        let config = DriverConfig {
            default_retries: 2,
            reopen_delay_ms: 50,
            ..DriverConfig::default()
        };
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{}", config.to_toml().unwrap()).unwrap();
        assert_eq!(DriverConfig::load_from(file.path()).unwrap(), config);
    }
}
