use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime settings, read from a TOML file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for keygen records.
    pub home_address: PathBuf,
    /// `tracing` filter directive, e.g. `info` or `keygen_ceremony=debug`.
    pub log_level: String,
    pub ceremony_timeout_secs: u64,
    /// Capacity of each peer's inbound gossip queue.
    pub inbound_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            home_address: PathBuf::from("./tss-home"),
            log_level: "info".into(),
            ceremony_timeout_secs: 600,
            inbound_capacity: 64,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn ceremony_timeout(&self) -> Duration {
        Duration::from_secs(self.ceremony_timeout_secs)
    }
}
