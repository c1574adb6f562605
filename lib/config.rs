//! Configuration Model

use config::builder::DefaultState;
use config::{
    Config as ConfigRaw,
    ConfigBuilder,
    ConfigError,
    Environment,
    File,
    FileFormat,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    pub prometheus_address: String,
    pub prometheus_port: u16,
}

/// The resolved configuration record consumed by the orchestrator core.
#[derive(Debug, Clone, Deserialize)]
pub struct DfoConfig {
    /// Per-send wait budget, in milliseconds.
    pub general_queue_timeout_ms: u64,
    /// Total drain budget at stop, divided into 20 sub-waits.
    pub stop_timeout_ms: u64,
    /// Occupancy at/above which an endpoint becomes busy.
    pub busy_threshold: usize,
    /// Occupancy at/below which an endpoint becomes free again.
    pub free_threshold: usize,
    /// Maximum send attempts per endpoint dispatch.
    pub td_send_retries: u32,
    /// Operational-metrics publication period, in seconds.
    pub metrics_interval_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub main: MainConfig,
    pub dfo: DfoConfig,
}

#[derive(Debug)]
pub struct ConfigLoader {
    builder: ConfigBuilder<DefaultState>,
}

impl ConfigLoader {
    /// Loads a fresh copy of the configuration from source.
    pub fn load(&self) -> Result<Config, ConfigError> {
        Self::deserialize(self.builder.build_cloned()?)
    }

    /// creates a new loader configured to load the default and overlays
    /// the user supplied config (if supplied).
    ///
    /// * `config_file`: The path of the configuration file to load.
    pub fn from_path(path: &Option<String>) -> ConfigLoader {
        let raw = include_str!("default.toml");
        let mut builder = ConfigRaw::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .add_source(
                Environment::with_prefix("DFO")
                    .try_parsing(true)
                    .separator("__"),
            );
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        ConfigLoader { builder }
    }

    fn deserialize(config: ConfigRaw) -> Result<Config, ConfigError> {
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads() {
        let config = ConfigLoader::from_path(&None).load().unwrap();
        assert!(config.dfo.busy_threshold >= config.dfo.free_threshold);
        assert!(config.dfo.td_send_retries >= 1);
        assert_eq!(100, config.dfo.general_queue_timeout_ms);
    }
}
