//! # Tuner Configuration
//!
//! Tunable parameters for the signal pipeline. The detection thresholds are
//! hand-tuned defaults rather than derived values, so all of them can be
//! overridden from a JSON file or from the command line.

use crate::error::ConfigError;
use crate::tuning::{MAX_REFERENCE_PITCH, MIN_REFERENCE_PITCH};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default sample rate requested from the capture device.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default number of samples per analysed block (~46 ms at 44.1 kHz).
pub const DEFAULT_BLOCK_LENGTH: usize = 2048;

/// Default A4 reference in Hz.
pub const DEFAULT_REFERENCE_PITCH: f32 = 440.0;

/// Minimum RMS amplitude a block needs to be analysed.
pub const DEFAULT_RMS_THRESHOLD: f32 = 0.008;

/// CMND value a dip has to fall below to be accepted as a period.
pub const DEFAULT_YIN_THRESHOLD: f32 = 0.15;

/// Lowest frequency reported as a pitch.
pub const DEFAULT_MIN_FREQUENCY: f32 = 20.0;

/// Highest frequency the estimator searches for.
pub const DEFAULT_MAX_FREQUENCY: f32 = 5000.0;

/// Smallest block the estimator can do anything useful with.
const MIN_BLOCK_LENGTH: usize = 8;

/// Complete configuration for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub sample_rate: u32,
    pub block_length: usize,
    pub reference_pitch: f32,
    pub rms_threshold: f32,
    pub yin_threshold: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_length: DEFAULT_BLOCK_LENGTH,
            reference_pitch: DEFAULT_REFERENCE_PITCH,
            rms_threshold: DEFAULT_RMS_THRESHOLD,
            yin_threshold: DEFAULT_YIN_THRESHOLD,
            min_frequency: DEFAULT_MIN_FREQUENCY,
            max_frequency: DEFAULT_MAX_FREQUENCY,
        }
    }
}

impl TunerConfig {
    /// Checks every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.block_length < MIN_BLOCK_LENGTH {
            return Err(ConfigError::InvalidBlockLength(self.block_length));
        }
        validate_reference_pitch(self.reference_pitch)?;
        validate_threshold("rms_threshold", self.rms_threshold)?;
        validate_threshold("yin_threshold", self.yin_threshold)?;

        let (min, max) = (self.min_frequency, self.max_frequency);
        let nyquist = self.sample_rate as f32 / 2.0;
        if !min.is_finite() || !max.is_finite() || min <= 0.0 || max <= min || max > nyquist {
            return Err(ConfigError::InvalidFrequencyRange { min, max });
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: TunerConfig = serde_json::from_str(&json)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }
}

/// Range check shared by the config file and the runtime reference setter.
pub fn validate_reference_pitch(hz: f32) -> Result<(), ConfigError> {
    if hz.is_finite() && (MIN_REFERENCE_PITCH..=MAX_REFERENCE_PITCH).contains(&hz) {
        Ok(())
    } else {
        Err(ConfigError::ReferenceOutOfRange(hz))
    }
}

fn validate_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(TunerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_reference_outside_range() {
        let config = TunerConfig {
            reference_pitch: 250.0,
            ..TunerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ReferenceOutOfRange(250.0))
        );
        assert!(validate_reference_pitch(f32::NAN).is_err());
        assert!(validate_reference_pitch(300.0).is_ok());
        assert!(validate_reference_pitch(600.0).is_ok());
    }

    #[test]
    fn rejects_bad_thresholds_and_ranges() {
        let config = TunerConfig {
            yin_threshold: 0.0,
            ..TunerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThreshold { name: "yin_threshold", .. })
        ));

        let config = TunerConfig {
            min_frequency: 900.0,
            max_frequency: 100.0,
            ..TunerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFrequencyRange { .. })
        ));

        let config = TunerConfig {
            max_frequency: 30_000.0,
            ..TunerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: TunerConfig = serde_json::from_str(r#"{ "reference_pitch": 442.0 }"#).unwrap();
        assert_eq!(config.reference_pitch, 442.0);
        assert_eq!(config.block_length, DEFAULT_BLOCK_LENGTH);
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!("tuner-config-{}.json", std::process::id()));
        let config = TunerConfig {
            reference_pitch: 415.0,
            rms_threshold: 0.004,
            ..TunerConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = TunerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
