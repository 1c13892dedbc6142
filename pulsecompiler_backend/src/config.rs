//! Hardware constants of the pulser.
//!
//! The values are supplied by the runtime collaborator (typically read from the device's
//! configuration file) and copied into the [`SequencerState`] when it is created. They are never
//! modified afterwards. All times are in seconds, all lengths in ticks.
//!
//! [`SequencerState`]: crate::sequencer::SequencerState

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::timebase::Ticks;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserConfig {
    /// Period of the internal clock, used when no timebase is declared.
    pub fixed_timebase: f64,
    /// Range accepted for an externally supplied timebase.
    pub min_timebase: f64,
    pub max_timebase: f64,
    /// Number of physical output channels.
    pub num_channels: usize,
    pub max_pulses_per_channel: usize,
    /// Longest pulse pattern the device memory can hold.
    pub max_pattern_length: Ticks,
    /// Size of the pattern memory, the base of the TWT duty-cycle budget.
    pub memory_capacity: Ticks,
    /// Ticks added to a shot for every unit of repeat time.
    pub repeat_tick_factor: Ticks,
    pub max_twt_duty_cycle: f64,
    pub default_shape_padding_left: f64,
    pub default_shape_padding_right: f64,
    pub default_twt_padding_left: f64,
    pub default_twt_padding_right: f64,
    pub default_shape_to_defense: f64,
    pub default_defense_to_shape: f64,
    pub default_min_twt_distance: f64,
}

impl Default for PulserConfig {
    fn default() -> Self {
        Self {
            fixed_timebase: 8.0e-9,
            min_timebase: 2.0e-9,
            max_timebase: 1.0e-6,
            num_channels: 24,
            max_pulses_per_channel: 60,
            max_pattern_length: 32_766,
            memory_capacity: 32_768,
            repeat_tick_factor: 1024,
            max_twt_duty_cycle: 0.02,
            default_shape_padding_left: 16.0e-9,
            default_shape_padding_right: 16.0e-9,
            default_twt_padding_left: 400.0e-9,
            default_twt_padding_right: 200.0e-9,
            default_shape_to_defense: 96.0e-9,
            default_defense_to_shape: 96.0e-9,
            default_min_twt_distance: 400.0e-9,
        }
    }
}

impl PulserConfig {
    /// Parses a configuration from JSON; missing fields take their default values.
    ///
    /// ```
    /// use pulsecompiler_backend::config::PulserConfig;
    ///
    /// let config = PulserConfig::from_json_str(r#"{ "num_channels": 8 }"#).unwrap();
    /// assert_eq!(config.num_channels, 8);
    /// assert_eq!(config.fixed_timebase, 8.0e-9);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PulserConfig =
            serde_json::from_str(json).map_err(|e| ErrorKind::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid =
            |msg: &str| -> Result<()> { Err(ErrorKind::InvalidConfig(msg.to_string()).into()) };
        if !(self.fixed_timebase > 0.0) {
            return invalid("fixed_timebase must be positive");
        }
        if !(self.min_timebase > 0.0 && self.min_timebase <= self.max_timebase) {
            return invalid("timebase range is empty");
        }
        if self.num_channels == 0 || self.max_pulses_per_channel == 0 {
            return invalid("channel limits must be positive");
        }
        if self.max_pattern_length <= 0 || self.memory_capacity <= 0 || self.repeat_tick_factor <= 0 {
            return invalid("pattern limits must be positive");
        }
        if !(self.max_twt_duty_cycle > 0.0 && self.max_twt_duty_cycle <= 1.0) {
            return invalid("max_twt_duty_cycle must be in (0, 1]");
        }
        let defaults = [
            self.default_shape_padding_left,
            self.default_shape_padding_right,
            self.default_twt_padding_left,
            self.default_twt_padding_right,
            self.default_shape_to_defense,
            self.default_defense_to_shape,
            self.default_min_twt_distance,
        ];
        if defaults.iter().any(|t| *t < 0.0) {
            return invalid("default paddings and distances must not be negative");
        }
        Ok(())
    }
}
