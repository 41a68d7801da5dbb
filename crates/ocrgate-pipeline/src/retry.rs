use serde::{Deserialize, Serialize};

use crate::config::GuardConfig;

/// How the working set shrinks after a resource-exhaustion failure.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Retry at the same scale.
    None,
    /// Halve the scale on each retry.
    #[default]
    Halve,
    /// Multiply the scale by `factor` on each retry.
    Scale { factor: f32 },
}

impl DegradePolicy {
    pub fn apply(&self, scale: f32) -> f32 {
        match self {
            DegradePolicy::None => scale,
            DegradePolicy::Halve => scale * 0.5,
            DegradePolicy::Scale { factor } => scale * factor,
        }
    }
}

/// Next move after an exhausted attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryStep {
    Retry { attempt: u32, scale: f32 },
    GiveUp,
}

/// Bounded retry state for one frame.
///
/// Starts at scale 1.0 for every frame; only the frame that hit exhaustion
/// runs degraded.
#[derive(Debug, Clone)]
pub struct RetryState {
    retries: u32,
    max_retries: u32,
    scale: f32,
    min_scale: f32,
    policy: DegradePolicy,
}

impl RetryState {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            retries: 0,
            max_retries: config.max_retries,
            scale: 1.0,
            min_scale: config.min_scale,
            policy: config.degrade,
        }
    }

    /// Retries taken so far; also the zero-based number of the next attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn on_exhausted(&mut self) -> RetryStep {
        if self.retries >= self.max_retries {
            return RetryStep::GiveUp;
        }
        self.retries += 1;
        self.scale = self.policy.apply(self.scale).max(self.min_scale);
        RetryStep::Retry {
            attempt: self.retries,
            scale: self.scale,
        }
    }
}
