//! # Pitch Detection Module
//!
//! This module implements the YIN fundamental-frequency estimator used by the
//! tuner engine. It runs on the audio callback thread, so all scratch memory is
//! allocated up front and reused for every block.
//!
//! ## Steps
//! - Lag range derived from the configured frequency range and block length
//! - Difference function over the lag range
//! - Cumulative mean normalized difference (CMND)
//! - Absolute threshold search for the first dip
//! - Parabolic interpolation for sub-sample accuracy

use crate::config::{DEFAULT_MAX_FREQUENCY, DEFAULT_MIN_FREQUENCY, DEFAULT_YIN_THRESHOLD};
use std::ops::Range;

/// Estimator parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YinConfig {
    /// CMND value a dip must fall below to be accepted.
    pub threshold: f32,
    /// Lowest frequency searched for and reported.
    pub min_frequency: f32,
    /// Highest frequency searched for; sets the smallest lag.
    pub max_frequency: f32,
}

impl Default for YinConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_YIN_THRESHOLD,
            min_frequency: DEFAULT_MIN_FREQUENCY,
            max_frequency: DEFAULT_MAX_FREQUENCY,
        }
    }
}

/// Computes the swept lag range `[tau_min, tau_max)` for a block.
///
/// # Returns
/// * `Some(range)` - The lags to test
/// * `None` - The block is too short for the configured frequency floor
pub fn lag_range(
    block_length: usize,
    sample_rate: u32,
    min_frequency: f32,
    max_frequency: f32,
) -> Option<Range<usize>> {
    if sample_rate == 0 || min_frequency <= 0.0 || max_frequency <= 0.0 {
        return None;
    }
    let sample_rate = sample_rate as f32;
    let tau_min = ((sample_rate / max_frequency).floor() as usize).max(2);
    let tau_max = ((sample_rate / min_frequency).floor() as usize)
        .min((block_length / 2).saturating_sub(1));

    if tau_max <= tau_min {
        None
    } else {
        Some(tau_min..tau_max)
    }
}

/// Scratch space holding one CMND value per lag.
///
/// Indexed directly by tau. Entries below `tau_min` are pinned to `1.0` so
/// they can never be selected.
#[derive(Debug, Clone, Default)]
pub struct YinWorkBuffer {
    values: Vec<f32>,
}

impl YinWorkBuffer {
    /// Creates a buffer able to hold `max_lag` values without reallocating.
    pub fn with_capacity(max_lag: usize) -> Self {
        Self {
            values: Vec::with_capacity(max_lag),
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    /// Resets the buffer to `len` entries of `1.0`.
    ///
    /// Does not allocate as long as `len` fits the preallocated capacity.
    fn reset(&mut self, len: usize) -> &mut [f32] {
        self.values.clear();
        self.values.resize(len, 1.0);
        &mut self.values
    }
}

/// YIN estimator with a reusable work buffer.
#[derive(Debug, Clone)]
pub struct YinEstimator {
    config: YinConfig,
    buffer: YinWorkBuffer,
}

impl YinEstimator {
    /// Creates an estimator whose work buffer is sized for `max_block_length`.
    ///
    /// Blocks up to that length are processed without heap traffic.
    pub fn new(config: YinConfig, max_block_length: usize) -> Self {
        Self {
            config,
            buffer: YinWorkBuffer::with_capacity(max_block_length / 2),
        }
    }

    pub fn config(&self) -> &YinConfig {
        &self.config
    }

    /// Estimates the fundamental frequency of one block.
    ///
    /// # Arguments
    /// * `samples` - Mono audio block
    /// * `sample_rate` - Sample rate in Hz
    ///
    /// # Returns
    /// * `Some(frequency)` - Detected frequency in Hz, never below the configured minimum
    /// * `None` - No pitch (block too short, no dip under threshold, or out of range)
    pub fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Option<f32> {
        let YinConfig {
            threshold,
            min_frequency,
            max_frequency,
        } = self.config;

        let lags = lag_range(samples.len(), sample_rate, min_frequency, max_frequency)?;
        let cmnd = self.buffer.reset(lags.end);

        difference(samples, lags.clone(), cmnd);
        cumulative_mean_normalized_difference(lags.clone(), cmnd);

        let tau_estimate = absolute_threshold(cmnd, lags.clone(), threshold)?;
        let refined_tau = parabolic_interpolation(cmnd, lags, tau_estimate);

        if refined_tau <= 0.0 {
            return None;
        }
        let frequency = sample_rate as f32 / refined_tau;
        if frequency.is_finite() && frequency >= min_frequency {
            Some(frequency)
        } else {
            None
        }
    }
}

/// Fills `out[tau]` with the squared difference of the block against itself shifted by `tau`.
fn difference(samples: &[f32], lags: Range<usize>, out: &mut [f32]) {
    let n = samples.len();
    for tau in lags {
        out[tau] = samples[..n - tau]
            .iter()
            .zip(&samples[tau..])
            .map(|(&a, &b)| {
                let delta = a - b;
                delta * delta
            })
            .sum();
    }
}

/// Normalizes the difference values in place, starting the running sum at `tau_min`.
fn cumulative_mean_normalized_difference(lags: Range<usize>, values: &mut [f32]) {
    let mut running_sum = 0.0f32;
    for tau in lags {
        running_sum += values[tau];
        values[tau] = if running_sum > f32::EPSILON {
            values[tau] * tau as f32 / running_sum
        } else {
            1.0
        };
    }
}

/// Finds the bottom of the first dip below `threshold`.
///
/// A dip still falling at the last swept lag has its minimum outside the
/// range and is rejected.
fn absolute_threshold(cmnd: &[f32], lags: Range<usize>, threshold: f32) -> Option<usize> {
    let end = lags.end;
    let mut tau = lags.start;
    while tau < end {
        if cmnd[tau] < threshold {
            while tau + 1 < end && cmnd[tau + 1] < cmnd[tau] {
                tau += 1;
            }
            if tau + 1 == end {
                return None;
            }
            if cmnd[tau] < threshold {
                return Some(tau);
            }
        }
        tau += 1;
    }
    None
}

/// Refines the lag estimate using its two neighbours.
///
/// Estimates on either edge of the swept range are returned unchanged.
fn parabolic_interpolation(cmnd: &[f32], lags: Range<usize>, tau: usize) -> f32 {
    if tau <= lags.start || tau + 1 >= lags.end {
        return tau as f32;
    }
    let y_minus = cmnd[tau - 1];
    let y_center = cmnd[tau];
    let y_plus = cmnd[tau + 1];

    let denominator = y_minus + y_plus - 2.0 * y_center;
    if denominator.abs() > f32::EPSILON {
        tau as f32 + (y_minus - y_plus) / (2.0 * denominator)
    } else {
        tau as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(frequency: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn assert_close(detected: Option<f32>, expected: f32) {
        let detected = detected.unwrap_or_else(|| panic!("no pitch for {expected} Hz"));
        let error = (detected - expected).abs() / expected;
        assert!(error < 0.01, "expected {expected} Hz, got {detected} Hz");
    }

    #[test]
    fn detects_guitar_strings() {
        let mut yin = YinEstimator::new(YinConfig::default(), 2048);
        for &f in &[82.41, 110.0, 146.83, 196.0, 246.94, 329.63] {
            assert_close(yin.estimate(&sine(f, 44_100, 2048), 44_100), f);
        }
    }

    #[test]
    fn detects_concert_a_at_48k() {
        let mut yin = YinEstimator::new(YinConfig::default(), 4096);
        assert_close(yin.estimate(&sine(440.0, 48_000, 4096), 48_000), 440.0);
        assert_close(yin.estimate(&sine(1000.0, 48_000, 4096), 48_000), 1000.0);
    }

    #[test]
    fn silence_has_no_pitch() {
        let mut yin = YinEstimator::new(YinConfig::default(), 2048);
        assert_eq!(yin.estimate(&[0.0; 2048], 44_100), None);
    }

    #[test]
    fn short_block_is_not_an_error() {
        let mut yin = YinEstimator::new(YinConfig::default(), 2048);
        assert_eq!(yin.estimate(&[0.1, -0.1, 0.1, -0.1], 44_100), None);
        assert_eq!(yin.estimate(&[], 44_100), None);
    }

    #[test]
    fn block_shorter_than_two_periods_of_the_floor_stays_in_range() {
        let config = YinConfig {
            min_frequency: 100.0,
            ..YinConfig::default()
        };
        let mut yin = YinEstimator::new(config, 2048);
        // 2 * 44100 / 100 = 882 samples would be needed to cover the floor.
        let block = sine(440.0, 44_100, 600);
        assert_close(yin.estimate(&block, 44_100), 440.0);
        let block = sine(120.0, 44_100, 600);
        assert_eq!(yin.estimate(&block, 44_100), None);
    }

    #[test]
    fn lag_range_bounds() {
        assert_eq!(lag_range(2048, 44_100, 20.0, 5000.0), Some(8..1023));
        assert_eq!(lag_range(2048, 44_100, 100.0, 44_100.0), Some(2..441));
        assert_eq!(lag_range(8, 44_100, 20.0, 5000.0), None);
        assert_eq!(lag_range(2048, 0, 20.0, 5000.0), None);
    }

    #[test]
    fn reuses_work_buffer() {
        let mut yin = YinEstimator::new(YinConfig::default(), 2048);
        let capacity = yin.buffer.capacity();
        for &f in &[100.0, 440.0, 880.0] {
            yin.estimate(&sine(f, 44_100, 2048), 44_100);
        }
        assert_eq!(yin.buffer.capacity(), capacity);
    }

    #[test]
    fn threshold_search_skips_shallow_dips() {
        let mut cmnd = vec![1.0; 12];
        cmnd[3] = 0.5;
        cmnd[4] = 0.3;
        cmnd[5] = 0.6;
        cmnd[7] = 0.1;
        cmnd[8] = 0.05;
        cmnd[9] = 0.2;
        assert_eq!(absolute_threshold(&cmnd, 2..12, 0.15), Some(8));
        assert_eq!(absolute_threshold(&cmnd, 2..12, 0.01), None);
    }

    #[test]
    fn dip_cut_off_by_range_end_is_rejected() {
        let cmnd = [1.0, 1.0, 0.9, 0.6, 0.12, 0.08, 0.05];
        assert_eq!(absolute_threshold(&cmnd, 2..7, 0.15), None);
        assert_eq!(absolute_threshold(&cmnd, 2..6, 0.15), None);
        assert_eq!(absolute_threshold(&[1.0, 1.0, 0.5, 0.1, 0.2], 2..5, 0.15), Some(3));
    }

    #[test]
    fn period_beyond_lag_range_has_no_pitch() {
        // Two periods exactly: the true lag sits just past `tau_max`.
        for (sample_rate, f) in [(44_100, 440.0), (44_100, 1000.0), (48_000, 440.0)] {
            let len = (2.0 * sample_rate as f32 / f).ceil() as usize;
            let mut yin = YinEstimator::new(YinConfig::default(), len);
            assert_eq!(yin.estimate(&sine(f, sample_rate, len), sample_rate), None, "{f} Hz");
        }
    }

    #[test]
    fn three_periods_are_enough() {
        for (sample_rate, f) in [(44_100, 440.0), (44_100, 1000.0), (48_000, 440.0)] {
            let len = (3.0 * sample_rate as f32 / f).ceil() as usize;
            let mut yin = YinEstimator::new(YinConfig::default(), len);
            assert_close(yin.estimate(&sine(f, sample_rate, len), sample_rate), f);
        }
    }

    #[test]
    fn interpolation_leaves_edges_alone() {
        let cmnd = [1.0, 1.0, 0.4, 0.1, 0.3, 0.9];
        assert_eq!(parabolic_interpolation(&cmnd, 2..6, 2), 2.0);
        assert_eq!(parabolic_interpolation(&cmnd, 2..6, 5), 5.0);
        let refined = parabolic_interpolation(&cmnd, 2..6, 3);
        assert!(refined > 3.0 && refined < 3.2);
    }

    #[test]
    fn flat_neighbourhood_is_not_amplified() {
        let cmnd = [1.0, 1.0, 0.1, 0.1, 0.1, 1.0];
        assert_eq!(parabolic_interpolation(&cmnd, 2..6, 3), 3.0);
    }
}
