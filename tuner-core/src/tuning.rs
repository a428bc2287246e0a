//! # Musical Tuning Module
//!
//! This module maps detected frequencies onto the twelve-tone equal-tempered
//! scale relative to a movable A4 reference.
//!
//! ## Features
//! - Nearest-chromatic-note classification with cents offset
//! - MIDI note number <-> frequency conversions
//! - Lock-free reference pitch shared between control and audio threads
//! - Note name parsing and formatting (e.g. "A4", "C#3", "Bb2")

use crate::config::{DEFAULT_MIN_FREQUENCY, DEFAULT_REFERENCE_PITCH, validate_reference_pitch};
use crate::error::ConfigError;
use log::warn;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// MIDI note number of A4.
pub const MIDI_NOTE_A4: i32 = 69;

/// Lowest accepted A4 reference in Hz.
pub const MIN_REFERENCE_PITCH: f32 = 300.0;

/// Highest accepted A4 reference in Hz.
pub const MAX_REFERENCE_PITCH: f32 = 600.0;

/// Octaves that have a named [`Pitch`].
pub const OCTAVE_RANGE: std::ops::RangeInclusive<i32> = 0..=8;

/// Pitch-class names, sharps only, indexed from C.
pub const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// The frequency assigned to A4, readable from the audio thread without locking.
///
/// Stored as the bit pattern of an `f32`, so every read is a single atomic load.
#[derive(Debug)]
pub struct ReferencePitch {
    bits: AtomicU32,
}

impl Default for ReferencePitch {
    fn default() -> Self {
        Self {
            bits: AtomicU32::new(DEFAULT_REFERENCE_PITCH.to_bits()),
        }
    }
}

impl ReferencePitch {
    /// Creates a reference, validating the initial value.
    pub fn new(hz: f32) -> Result<Self, ConfigError> {
        validate_reference_pitch(hz)?;
        Ok(Self {
            bits: AtomicU32::new(hz.to_bits()),
        })
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Stores a new reference. Values outside 300-600 Hz are rejected and
    /// the previous value stays in effect.
    pub fn set(&self, hz: f32) -> Result<(), ConfigError> {
        if let Err(e) = validate_reference_pitch(hz) {
            warn!("Ignoring reference pitch {hz} Hz: {e}");
            return Err(e);
        }
        self.bits.store(hz.to_bits(), Ordering::Release);
        Ok(())
    }
}

/// A note the detected frequency was mapped to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedNote {
    /// 0 = C ... 11 = B
    pub pitch_class: u8,
    pub octave: i32,
    pub midi: i32,
    /// Deviation from the nearest chromatic note (positive = sharp).
    pub cents: f32,
    /// The frequency that was classified, in Hz.
    pub frequency: f32,
}

impl DetectedNote {
    pub fn name(&self) -> &'static str {
        PITCH_CLASS_NAMES[self.pitch_class as usize]
    }

    pub fn pitch(&self) -> Pitch {
        Pitch {
            pitch_class: self.pitch_class,
            octave: self.octave,
        }
    }
}

/// Per-block classification result. Either every field is available or none is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NoteClassification {
    /// Gated out, no pitch found, or outside the mappable range.
    #[default]
    Unavailable,
    Note(DetectedNote),
}

impl NoteClassification {
    pub fn note(&self) -> Option<&DetectedNote> {
        match self {
            NoteClassification::Note(note) => Some(note),
            NoteClassification::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, NoteClassification::Note(_))
    }

    /// Note name with octave, e.g. `"A4"`.
    pub fn note_name(&self) -> Option<String> {
        self.note().map(|n| format!("{}{}", n.name(), n.octave))
    }
}

impl fmt::Display for NoteClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteClassification::Unavailable => write!(f, "--"),
            NoteClassification::Note(n) => {
                write!(f, "{}{} {:+.1} cents ({:.2} Hz)", n.name(), n.octave, n.cents, n.frequency)
            }
        }
    }
}

/// Converts frequencies into chromatic note classifications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteMapper {
    min_frequency: f32,
}

impl Default for NoteMapper {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FREQUENCY)
    }
}

impl NoteMapper {
    pub fn new(min_frequency: f32) -> Self {
        Self { min_frequency }
    }

    /// Classifies `frequency` against the nearest chromatic note under `reference`.
    ///
    /// The cents offset is measured against that nearest note, so it normally
    /// stays within +/-50 cents.
    pub fn classify(&self, frequency: f32, reference: f32) -> NoteClassification {
        if !frequency.is_finite() || frequency < self.min_frequency {
            return NoteClassification::Unavailable;
        }
        if !reference.is_finite() || reference <= 0.0 {
            return NoteClassification::Unavailable;
        }

        let midi_float = 12.0 * (frequency / reference).log2() + MIDI_NOTE_A4 as f32;
        let midi = midi_float.round() as i32;
        if midi < 0 {
            return NoteClassification::Unavailable;
        }

        let theoretical = frequency_for_midi_note(midi, reference);
        let cents = if theoretical > f32::EPSILON {
            calculate_cents_deviation(frequency, theoretical)
        } else {
            0.0
        };

        NoteClassification::Note(DetectedNote {
            pitch_class: midi.rem_euclid(12) as u8,
            octave: midi / 12 - 1,
            midi,
            cents,
            frequency,
        })
    }
}

/// Equal-tempered frequency of a MIDI note under the given A4 reference.
pub fn frequency_for_midi_note(midi: i32, reference: f32) -> f32 {
    reference * 2.0f32.powf((midi - MIDI_NOTE_A4) as f32 / 12.0)
}

/// Calculates the deviation from a target frequency in cents.
///
/// Positive values are sharp, negative values are flat.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// A named note in scientific pitch notation, e.g. E2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pitch {
    pub pitch_class: u8,
    pub octave: i32,
}

impl Pitch {
    pub const fn new(pitch_class: u8, octave: i32) -> Self {
        Self {
            pitch_class,
            octave,
        }
    }

    /// MIDI number, or `None` outside [`OCTAVE_RANGE`].
    pub fn midi(&self) -> Option<i32> {
        if self.pitch_class > 11 || !OCTAVE_RANGE.contains(&self.octave) {
            return None;
        }
        Some(self.pitch_class as i32 + (self.octave + 1) * 12)
    }

    /// Inverse of [`Pitch::midi`]. Notes below C0 have no named pitch.
    pub fn from_midi(midi: i32) -> Option<Self> {
        if midi < 12 {
            return None;
        }
        let octave = midi / 12 - 1;
        if !OCTAVE_RANGE.contains(&octave) {
            return None;
        }
        Some(Self::new((midi % 12) as u8, octave))
    }

    pub fn frequency(&self, reference: f32) -> Option<f32> {
        self.midi().map(|m| frequency_for_midi_note(m, reference))
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = PITCH_CLASS_NAMES
            .get(self.pitch_class as usize)
            .copied()
            .unwrap_or("?");
        write!(f, "{}{}", name, self.octave)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid note name: {0:?}")]
pub struct ParsePitchError(String);

impl FromStr for Pitch {
    type Err = ParsePitchError;

    /// Parses names such as `"E2"`, `"C#3"`, `"C♯3"`, `"Bb2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePitchError(s.to_string());
        let s = s.trim();
        let mut chars = s.chars();

        let letter = chars.next().ok_or_else(err)?.to_ascii_uppercase();
        let natural: i32 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(err()),
        };

        let rest = chars.as_str();
        let sharp = rest.strip_prefix('#').or(rest.strip_prefix('♯'));
        let flat = rest.strip_prefix('b').or(rest.strip_prefix('♭'));
        let (accidental, octave) = if let Some(o) = sharp {
            (1, o)
        } else if let Some(o) = flat {
            (-1, o)
        } else {
            (0, rest)
        };

        let octave: i32 = octave.parse().map_err(|_| err())?;
        let semitone = natural + accidental;
        // Cb and B# cross the octave boundary.
        let (pitch_class, octave) = (semitone.rem_euclid(12), octave + semitone.div_euclid(12));
        Ok(Pitch::new(pitch_class as u8, octave))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concert_a() {
        let note = NoteMapper::default().classify(440.0, 440.0);
        let note = note.note().copied().unwrap();
        assert_eq!(note.pitch_class, 9);
        assert_eq!(note.octave, 4);
        assert_eq!(note.midi, 69);
        assert!(note.cents.abs() < 1e-3);
        assert_eq!(NoteMapper::default().classify(440.0, 440.0).note_name().as_deref(), Some("A4"));
    }

    #[test]
    fn cents_follow_the_nearest_note() {
        let mapper = NoteMapper::default();
        // 30 cents sharp of A4
        let sharp = 440.0 * 2f32.powf(30.0 / 1200.0);
        let note = *mapper.classify(sharp, 440.0).note().unwrap();
        assert_eq!(note.midi, 69);
        assert!((note.cents - 30.0).abs() < 0.05);

        // 70 cents sharp of A4 is 30 cents flat of A#4
        let sharper = 440.0 * 2f32.powf(70.0 / 1200.0);
        let note = *mapper.classify(sharper, 440.0).note().unwrap();
        assert_eq!(note.midi, 70);
        assert_eq!(note.name(), "A#");
        assert!((note.cents + 30.0).abs() < 0.05);
    }

    #[test]
    fn reference_moves_the_scale() {
        let note = *NoteMapper::default().classify(442.0, 442.0).note().unwrap();
        assert_eq!(note.midi, 69);
        assert!(note.cents.abs() < 1e-3);

        let note = *NoteMapper::default().classify(440.0, 442.0).note().unwrap();
        assert_eq!(note.midi, 69);
        assert!(note.cents < -7.0 && note.cents > -8.5);
    }

    #[test]
    fn rejects_low_and_invalid_frequencies() {
        let mapper = NoteMapper::default();
        assert_eq!(mapper.classify(19.9, 440.0), NoteClassification::Unavailable);
        assert_eq!(mapper.classify(f32::NAN, 440.0), NoteClassification::Unavailable);
        assert_eq!(mapper.classify(0.0, 440.0), NoteClassification::Unavailable);
        // 5 Hz maps below MIDI 0 once the floor is lowered
        assert_eq!(NoteMapper::new(1.0).classify(5.0, 440.0), NoteClassification::Unavailable);
    }

    #[test]
    fn rejects_non_finite_reference() {
        let mapper = NoteMapper::default();
        assert_eq!(mapper.classify(440.0, f32::NAN), NoteClassification::Unavailable);
        assert_eq!(mapper.classify(440.0, f32::INFINITY), NoteClassification::Unavailable);
        assert_eq!(mapper.classify(440.0, 0.0), NoteClassification::Unavailable);
    }

    #[test]
    fn middle_c_and_low_e() {
        let mapper = NoteMapper::default();
        let c4 = *mapper.classify(261.63, 440.0).note().unwrap();
        assert_eq!((c4.pitch_class, c4.octave, c4.midi), (0, 4, 60));
        let e2 = *mapper.classify(82.41, 440.0).note().unwrap();
        assert_eq!((e2.name(), e2.octave), ("E", 2));
    }

    #[test]
    fn reference_pitch_validates_writes() {
        let reference = ReferencePitch::default();
        assert_eq!(reference.get(), 440.0);
        assert_eq!(reference.set(250.0), Err(ConfigError::ReferenceOutOfRange(250.0)));
        assert_eq!(reference.get(), 440.0);
        assert!(reference.set(f32::INFINITY).is_err());
        assert_eq!(reference.set(442.0), Ok(()));
        assert_eq!(reference.get(), 442.0);
        assert!(ReferencePitch::new(601.0).is_err());
    }

    #[test]
    fn midi_and_pitch_conversions() {
        assert_eq!(Pitch::new(9, 4).midi(), Some(69));
        assert_eq!(Pitch::new(0, 0).midi(), Some(12));
        assert_eq!(Pitch::new(0, 9).midi(), None);
        assert_eq!(Pitch::from_midi(69), Some(Pitch::new(9, 4)));
        assert_eq!(Pitch::from_midi(11), None);
        assert_eq!(Pitch::from_midi(120), None);
        assert!((frequency_for_midi_note(60, 440.0) - 261.6256).abs() < 0.01);
    }

    #[test]
    fn parses_note_names() {
        assert_eq!("E2".parse::<Pitch>(), Ok(Pitch::new(4, 2)));
        assert_eq!("C#3".parse::<Pitch>(), Ok(Pitch::new(1, 3)));
        assert_eq!("F♯4".parse::<Pitch>(), Ok(Pitch::new(6, 4)));
        assert_eq!("Bb2".parse::<Pitch>(), Ok(Pitch::new(10, 2)));
        assert_eq!("Cb4".parse::<Pitch>(), Ok(Pitch::new(11, 3)));
        assert_eq!("a4".parse::<Pitch>(), Ok(Pitch::new(9, 4)));
        assert!("H2".parse::<Pitch>().is_err());
        assert!("E".parse::<Pitch>().is_err());
        assert!("".parse::<Pitch>().is_err());
        assert_eq!(Pitch::new(1, 3).to_string(), "C#3");
    }
}
