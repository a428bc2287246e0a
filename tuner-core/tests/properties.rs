//! Property-based tests for the analysis pipeline.
//!
//! Covers note mapping under arbitrary reference pitches, YIN accuracy on
//! clean sines, and noise gate scaling, using proptest for input generation.

use proptest::prelude::*;
use std::f32::consts::PI;
use tuner_core::gate::{NoiseGate, rms};
use tuner_core::pitch::{YinConfig, YinEstimator};
use tuner_core::tuning::{NoteMapper, frequency_for_midi_note};

fn sine(frequency: f32, sample_rate: u32, phase: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / sample_rate as f32 + phase).sin())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The exact equal-tempered frequency of a note maps back to that note
    /// with no cents offset, for any reference in the accepted range.
    #[test]
    fn note_frequency_round_trips(
        midi in 24i32..=120,
        reference in 300.0f32..600.0f32,
    ) {
        let mapper = NoteMapper::default();
        let frequency = frequency_for_midi_note(midi, reference);
        let classification = mapper.classify(frequency, reference);
        let note = classification.note();
        prop_assert!(note.is_some(), "{frequency} Hz unavailable at A4={reference}");
        let note = note.unwrap();
        prop_assert_eq!(note.midi, midi);
        prop_assert_eq!(i32::from(note.pitch_class), midi.rem_euclid(12));
        prop_assert_eq!(note.octave, midi / 12 - 1);
        prop_assert!(note.cents.abs() < 0.05, "cents = {}", note.cents);
    }

    /// Any frequency maps to its nearest note, so the offset stays within half a semitone.
    #[test]
    fn cents_stay_within_half_semitone(
        frequency in 20.0f32..5000.0f32,
        reference in 300.0f32..600.0f32,
    ) {
        let classification = NoteMapper::default().classify(frequency, reference);
        let note = classification.note();
        prop_assert!(note.is_some());
        prop_assert!(note.unwrap().cents.abs() <= 50.01, "cents = {}", note.unwrap().cents);
    }

    /// RMS scales linearly with the signal, so the gate decision does too.
    #[test]
    fn gate_follows_amplitude(
        input in prop::collection::vec(-1.0f32..=1.0f32, 1..512),
        gain in 0.01f32..1.0f32,
    ) {
        let scaled: Vec<f32> = input.iter().map(|s| s * gain).collect();
        let expected = rms(&input) * gain;
        prop_assert!((rms(&scaled) - expected).abs() <= 1e-4 + expected * 1e-4);

        let gate = NoiseGate::new(0.008);
        prop_assert_eq!(gate.passes(&scaled), rms(&scaled) >= 0.008);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// YIN stays within 1% of a clean sine across the guitar-to-soprano range.
    #[test]
    fn yin_tracks_clean_sines(
        frequency in 80.0f32..1000.0f32,
        sample_rate in prop::sample::select(vec![44_100u32, 48_000]),
        phase in 0.0f32..(2.0 * PI),
    ) {
        let mut yin = YinEstimator::new(YinConfig::default(), 4096);
        let samples = sine(frequency, sample_rate, phase, 4096);
        let detected = yin.estimate(&samples, sample_rate);
        prop_assert!(detected.is_some(), "no pitch for {frequency} Hz at {sample_rate} Hz");
        let detected = detected.unwrap();
        let error = (detected - frequency).abs() / frequency;
        prop_assert!(error < 0.01, "expected {frequency}, got {detected}");
    }

    /// Near the two-period minimum a block either yields no pitch or an
    /// accurate one, never a lag clipped at the end of the range.
    #[test]
    fn short_blocks_never_report_clipped_lags(
        frequency in 80.0f32..1000.0f32,
        sample_rate in prop::sample::select(vec![44_100u32, 48_000]),
        periods in 2.0f32..3.0f32,
    ) {
        let len = (periods * sample_rate as f32 / frequency).ceil() as usize;
        let mut yin = YinEstimator::new(YinConfig::default(), len);
        let samples = sine(frequency, sample_rate, 0.0, len);
        if let Some(detected) = yin.estimate(&samples, sample_rate) {
            let error = (detected - frequency).abs() / frequency;
            prop_assert!(error < 0.01, "len {len}: expected {frequency}, got {detected}");
        }
    }
}
