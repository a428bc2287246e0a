//! # Noise Gate
//!
//! Silence and low-level noise produce unstable lag estimates, so blocks are
//! checked for energy before the estimator runs.

use crate::config::DEFAULT_RMS_THRESHOLD;

/// RMS amplitude gate in front of the pitch estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseGate {
    threshold: f32,
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new(DEFAULT_RMS_THRESHOLD)
    }
}

impl NoiseGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Returns true when the block is loud enough to analyse.
    #[inline]
    pub fn passes(&self, samples: &[f32]) -> bool {
        rms(samples) >= self.threshold
    }
}

/// Root-mean-square amplitude. An empty block has zero energy.
#[inline]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_of_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_gated() {
        let gate = NoiseGate::default();
        assert!(!gate.passes(&[0.0; 1024]));
        assert!(!gate.passes(&[]));
    }

    #[test]
    fn quiet_noise_is_gated() {
        // Deterministic pseudo-noise with amplitude well under the threshold.
        let mut state: u32 = 0x1234_5678;
        let noise: Vec<f32> = (0..2048)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 8) as f32 / (1u32 << 24) as f32 - 0.5) * 0.004
            })
            .collect();
        assert!(rms(&noise) < DEFAULT_RMS_THRESHOLD);
        assert!(!NoiseGate::default().passes(&noise));
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert!((rms(&[-0.25; 64]) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn threshold_is_inclusive() {
        let gate = NoiseGate::new(0.5);
        assert!(gate.passes(&[0.5; 16]));
        assert!(!gate.passes(&[0.49; 16]));
    }
}
