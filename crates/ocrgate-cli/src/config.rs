use std::path::Path;

use serde::{Deserialize, Serialize};

use ocrgate_backends::BackendsConfig;
use ocrgate_pipeline::GatewayConfig;

/// Everything the binary reads from `--config`: the dispatcher settings at
/// the top level plus a `backends` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub gateway: GatewayConfig,
    pub backends: BackendsConfig,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum Preset {
    #[default]
    Default,
    Development,
    LowMemory,
}

impl AppConfig {
    pub fn from_preset(preset: Preset) -> Self {
        let gateway = match preset {
            Preset::Default => GatewayConfig::default(),
            Preset::Development => GatewayConfig::development(),
            Preset::LowMemory => GatewayConfig::low_memory(),
        };
        Self {
            gateway,
            backends: BackendsConfig::default(),
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.gateway.validate()?;
        Ok(config)
    }
}
