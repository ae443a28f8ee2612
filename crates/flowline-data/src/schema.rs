//! Serde structs for the run configuration file.
//!
//! The model file uses the snapshot schema from
//! [`flowline_core::snapshot`] directly. This module covers `run.*`, the
//! per-run settings that sit next to it, and converts them into a
//! [`SimConfig`].

use flowline_core::engine::SimConfig;
use flowline_core::time::{SimTime, TimeUnit, from_f64};
use serde::Deserialize;

// ===========================================================================
// Run configuration
// ===========================================================================

/// Settings for one run. Every field is optional; durations are expressed
/// in `time_unit`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfigData {
    pub seed: u64,
    pub time_unit: TimeUnit,
    pub horizon: Option<f64>,
    pub max_events: Option<u64>,
    pub probe_window: Option<f64>,
    pub retry_interval: Option<f64>,
    pub display_unit: Option<TimeUnit>,
}

/// A duration field that cannot be represented as simulated time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {field}: {value}")]
pub struct ConfigValueError {
    pub field: &'static str,
    pub value: f64,
}

impl RunConfigData {
    /// Convert into engine settings. Positivity of the probe window and
    /// retry interval is checked again when the simulation is built.
    pub fn to_sim_config(&self) -> Result<SimConfig, ConfigValueError> {
        let defaults = SimConfig::default();
        let time = |field: &'static str, value: f64| -> Result<SimTime, ConfigValueError> {
            if value < 0.0 {
                return Err(ConfigValueError { field, value });
            }
            from_f64(value, self.time_unit).ok_or(ConfigValueError { field, value })
        };
        Ok(SimConfig {
            seed: self.seed,
            horizon: self.horizon.map(|v| time("horizon", v)).transpose()?,
            max_events: self.max_events,
            probe_window: match self.probe_window {
                Some(v) => time("probe_window", v)?,
                None => defaults.probe_window,
            },
            retry_interval: self
                .retry_interval
                .map(|v| time("retry_interval", v))
                .transpose()?,
            display_unit: self.display_unit.unwrap_or(self.time_unit),
        })
    }
}
