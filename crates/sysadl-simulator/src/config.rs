//! Engine configuration, validation and defaults

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Trait for configuration validation
pub trait ConfigValidation {
    /// Validate configuration parameters
    fn validate(&self) -> Result<()>;
}

/// Trait for providing configuration defaults
pub trait ConfigDefaults {
    /// Get default configuration for testing
    fn testing_defaults() -> Self;
    /// Get default configuration for production
    fn production_defaults() -> Self;
}

/// Runtime limits and policies for a [`crate::SimulationEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Iteration guard for `while` and `for` loops
    pub max_loop_iterations: u64,
    /// Maximum nested-scenario depth
    pub max_nesting_depth: usize,
    /// Lower bound for `set_speed`
    pub min_speed: f64,
    /// Upper bound for `set_speed`
    pub max_speed: f64,
    /// Scale scene timeouts by the speed factor (unscaled by default)
    pub scale_scene_timeouts: bool,
    /// Timeout used when a scene does not declare one
    pub default_scene_timeout_ms: u64,
    /// Capacity of the event notice broadcast channel
    pub event_channel_capacity: usize,
    /// Mirror execution log entries to `tracing`
    pub mirror_to_tracing: bool,
    /// Fire a `condition` injection right away when its condition already holds
    pub fire_condition_injection_if_already_true: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 100_000,
            max_nesting_depth: 32,
            min_speed: 0.01,
            max_speed: 1000.0,
            scale_scene_timeouts: false,
            default_scene_timeout_ms: 30_000,
            event_channel_capacity: 1024,
            mirror_to_tracing: true,
            fire_condition_injection_if_already_true: true,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamp a requested speed factor into the configured bounds
    pub fn clamp_speed(&self, factor: f64) -> f64 {
        factor.clamp(self.min_speed, self.max_speed)
    }
}

impl ConfigValidation for EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.max_loop_iterations == 0 {
            return Err(EngineError::configuration(
                "max_loop_iterations must be greater than 0",
            ));
        }
        if self.max_nesting_depth == 0 {
            return Err(EngineError::configuration(
                "max_nesting_depth must be greater than 0",
            ));
        }
        if !(self.min_speed > 0.0 && self.min_speed <= self.max_speed) {
            return Err(EngineError::configuration(
                "speed bounds must satisfy 0 < min_speed <= max_speed",
            ));
        }
        if self.default_scene_timeout_ms == 0 {
            return Err(EngineError::configuration(
                "default_scene_timeout_ms must be greater than 0",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(EngineError::configuration(
                "event_channel_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl ConfigDefaults for EngineConfig {
    fn testing_defaults() -> Self {
        Self {
            max_loop_iterations: 10_000,
            default_scene_timeout_ms: 5_000,
            mirror_to_tracing: false,
            ..Self::default()
        }
    }

    fn production_defaults() -> Self {
        Self::default()
    }
}
