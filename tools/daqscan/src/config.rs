//! daqscan configuration
//!
//! Defaults layered under an optional YAML file and `DAQSCAN_`-prefixed
//! environment variables; CLI flags override the merged result.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqscanConfig {
    /// UDP discovery port
    pub discovery_port: u16,
    /// Default stream frequency in Hz
    pub stream_frequency: u32,
    /// Default ADC channel enable mask (LSB = AI0)
    pub channel_mask: u32,
}

impl Default for DaqscanConfig {
    fn default() -> Self {
        Self {
            discovery_port: daqifi_core::discovery::DISCOVERY_PORT,
            stream_frequency: 100,
            channel_mask: 0x1,
        }
    }
}

impl DaqscanConfig {
    /// Load configuration: defaults < YAML file (if present) < environment
    pub fn load(path: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(DaqscanConfig::default()));
        if Path::new(path).exists() {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("DAQSCAN_"))
            .extract()
            .with_context(|| format!("failed to load configuration from {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = DaqscanConfig::load("does-not-exist.yaml").unwrap();
        assert_eq!(config.discovery_port, 30303);
        assert_eq!(config.stream_frequency, 100);
    }
}
