use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ocrgate_core::{OcrError, Result};
use ocrgate_decode::NormalizeConfig;
use ocrgate_device::DeviceConfig;

use crate::retry::DegradePolicy;

/// Accelerator guard retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Retries per frame after resource exhaustion.
    pub max_retries: u32,
    /// Working-set reduction applied before each retry.
    pub degrade: DegradePolicy,
    /// Lower bound for the working-set scale.
    pub min_scale: f32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            degrade: DegradePolicy::Halve,
            min_scale: 0.125,
        }
    }
}

/// Runtime configuration for the request dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backends to register from the catalog, in order.
    pub enabled_backends: Vec<String>,
    /// Requests allowed to wait for the accelerator before new ones are
    /// rejected as overloaded.
    pub max_queue_depth: usize,
    /// Default request deadline, measured from arrival.
    pub request_timeout_secs: u64,
    pub guard: GuardConfig,
    pub normalize: NormalizeConfig,
    pub device: DeviceConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled_backends: vec!["mock".to_string()],
            max_queue_depth: 32,
            request_timeout_secs: 120,
            guard: GuardConfig::default(),
            normalize: NormalizeConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Small queue, short timeout, 2 GiB device. For local runs.
    pub fn development() -> Self {
        Self {
            max_queue_depth: 4,
            request_timeout_secs: 30,
            normalize: NormalizeConfig {
                render_dpi: 150.0,
                ..NormalizeConfig::default()
            },
            device: DeviceConfig {
                label: "dev0".to_string(),
                capacity_bytes: 2 * 1024 * 1024 * 1024,
            },
            ..Self::default()
        }
    }

    /// 1 GiB device with deeper degradation before frames are given up.
    pub fn low_memory() -> Self {
        Self {
            max_queue_depth: 8,
            guard: GuardConfig {
                max_retries: 3,
                degrade: DegradePolicy::Halve,
                min_scale: 0.0625,
            },
            normalize: NormalizeConfig {
                render_dpi: 200.0,
                ..NormalizeConfig::default()
            },
            device: DeviceConfig {
                capacity_bytes: 1024 * 1024 * 1024,
                ..DeviceConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(OcrError::Config(msg));

        if self.enabled_backends.is_empty() {
            return fail("enabled_backends is empty".into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.enabled_backends.iter().find(|n| !seen.insert(n.as_str())) {
            return fail(format!("backend '{dup}' enabled twice"));
        }
        if self.max_queue_depth == 0 {
            return fail("max_queue_depth must be at least 1".into());
        }
        if self.request_timeout_secs == 0 {
            return fail("request_timeout_secs must be positive".into());
        }
        if !(self.guard.min_scale > 0.0 && self.guard.min_scale <= 1.0) {
            return fail(format!("guard.min_scale {} outside (0, 1]", self.guard.min_scale));
        }
        if let DegradePolicy::Scale { factor } = self.guard.degrade {
            if !(factor > 0.0 && factor < 1.0) {
                return fail(format!("degrade factor {factor} outside (0, 1)"));
            }
        }
        if !(self.normalize.render_dpi > 0.0) {
            return fail(format!("normalize.render_dpi {} must be positive", self.normalize.render_dpi));
        }
        if self.normalize.max_frames == 0 {
            return fail("normalize.max_frames must be at least 1".into());
        }
        if self.device.capacity_bytes == 0 {
            return fail("device.capacity_bytes must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        GatewayConfig::default().validate().unwrap();
        GatewayConfig::development().validate().unwrap();
        GatewayConfig::low_memory().validate().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"max_queue_depth": 3, "guard": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.max_queue_depth, 3);
        assert_eq!(config.guard.max_retries, 5);
        assert_eq!(config.guard.degrade, DegradePolicy::Halve);
        assert_eq!(config.request_timeout_secs, 120);
        assert_eq!(config.normalize.render_dpi, 300.0);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.max_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.enabled_backends = vec!["mock".into(), "mock".into()];
        assert!(matches!(config.validate(), Err(OcrError::Config(ref m)) if m.contains("twice")));

        let mut config = GatewayConfig::default();
        config.guard.degrade = DegradePolicy::Scale { factor: 1.5 };
        assert!(config.validate().is_err());
    }
}
