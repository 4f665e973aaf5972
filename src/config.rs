//! Per-machine configuration and runtime preferences.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration of a single machine, read once at construction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MachineConfig {
    /// Display name of the machine. Onboard parameters may override this
    /// after a connect.
    pub name: String,

    /// Driver section, opaque to the controller and handed to the driver
    /// factory untouched.
    #[serde(default)]
    pub driver: Option<toml::Value>,

    /// Newline-separated G-code run before every build.
    #[serde(default)]
    pub warmup: Option<String>,

    /// Newline-separated G-code run after every build.
    #[serde(default)]
    pub cooldown: Option<String>,
}

impl MachineConfig {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }

    pub(crate) fn warmup_lines(&self) -> Vec<String> {
        Self::split_block(self.warmup.as_deref())
    }

    pub(crate) fn cooldown_lines(&self) -> Vec<String> {
        Self::split_block(self.cooldown.as_deref())
    }

    fn split_block(block: Option<&str>) -> Vec<String> {
        block
            .unwrap_or_default()
            .lines()
            .map(|l| l.trim().to_owned())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Runtime preferences consulted by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Preferences {
    /// Load the simulator driver at construction.
    #[serde(default = "default_true")]
    pub simulator: bool,

    /// Mirror machine-targeted builds into the simulator stream.
    #[serde(default)]
    pub show_simulator: bool,

    /// Poll temperatures during builds and emit tool-status events.
    #[serde(default)]
    pub monitor_temp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            simulator: true,
            show_simulator: false,
            monitor_temp: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_str() {
        let config = r#"
            name = "replicator"
            warmup = "M104 S200\nG21"
            cooldown = "M104 S0"

            [driver]
            kind = "serialpass"
            port = "/dev/ttyUSB0"
        "#;
        let config = MachineConfig::from_str(config).unwrap();
        assert_eq!(config.name, "replicator");
        assert_eq!(config.warmup_lines(), vec!["M104 S200", "G21"]);
        assert_eq!(config.cooldown_lines(), vec!["M104 S0"]);
        let driver = config.driver.unwrap();
        assert_eq!(driver.get("kind").unwrap().as_str().unwrap(), "serialpass");
    }

    #[test]
    fn config_minimal() {
        let config = MachineConfig::from_str(r#"name = "bare""#).unwrap();
        assert!(config.driver.is_none());
        assert!(config.warmup_lines().is_empty());
        assert!(config.cooldown_lines().is_empty());
    }

    #[test]
    fn preferences_defaults() {
        let prefs: Preferences = toml::from_str("").unwrap();
        assert!(prefs.simulator);
        assert!(!prefs.show_simulator);
        assert!(!prefs.monitor_temp);
    }
}
