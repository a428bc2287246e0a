//! # Instrument Tunings
//!
//! Preset string tunings and the helpers a host uses to tune against a
//! specific string instead of the nearest chromatic note.

use crate::tuning::{DetectedNote, Pitch, calculate_cents_deviation};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// A detected note within this many semitones of a string selects that string.
pub const AUTO_SELECT_SEMITONE_THRESHOLD: i32 = 2;

/// Offsets within this many cents count as in tune.
pub const IN_TUNE_CENTS: f32 = 10.0;

/// Identifier of the chromatic mode, which has no fixed strings.
pub const CHROMATIC: &str = "chromatic";

/// A named set of open-string pitches in string order.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentTuning {
    pub id: &'static str,
    pub name: &'static str,
    pub strings: Vec<Pitch>,
}

impl InstrumentTuning {
    fn new(id: &'static str, name: &'static str, strings: &[&str]) -> Self {
        Self {
            id,
            name,
            strings: strings.iter().filter_map(|s| s.parse().ok()).collect(),
        }
    }

    pub fn is_chromatic(&self) -> bool {
        self.strings.is_empty()
    }

    /// Picks the string closest to `midi`.
    ///
    /// Returns `None` when no string lies within
    /// [`AUTO_SELECT_SEMITONE_THRESHOLD`] semitones. Ties go to the earlier string.
    pub fn nearest_string(&self, midi: i32) -> Option<Pitch> {
        self.strings
            .iter()
            .filter_map(|p| p.midi().map(|m| (p, (m - midi).abs())))
            .min_by_key(|&(_, distance)| distance)
            .filter(|&(_, distance)| distance <= AUTO_SELECT_SEMITONE_THRESHOLD)
            .map(|(p, _)| *p)
    }
}

/// All presets, computed once.
static TUNINGS: Lazy<Vec<InstrumentTuning>> = Lazy::new(|| {
    vec![
        InstrumentTuning::new(CHROMATIC, "Chromatic", &[]),
        InstrumentTuning::new(
            "guitar-standard",
            "Guitar (Standard)",
            &["E2", "A2", "D3", "G3", "B3", "E4"],
        ),
        InstrumentTuning::new(
            "guitar-drop-d",
            "Guitar (Drop D)",
            &["D2", "A2", "D3", "G3", "B3", "E4"],
        ),
        InstrumentTuning::new(
            "guitar-drop-c",
            "Guitar (Drop C)",
            &["C2", "G2", "C3", "F3", "A3", "D4"],
        ),
        InstrumentTuning::new(
            "guitar-open-g",
            "Guitar (Open G)",
            &["D2", "G2", "D3", "G3", "B3", "D4"],
        ),
        InstrumentTuning::new(
            "guitar-dadgad",
            "Guitar (DADGAD)",
            &["D2", "A2", "D3", "G3", "A3", "D4"],
        ),
        InstrumentTuning::new("bass-4", "Bass 4-string", &["E1", "A1", "D2", "G2"]),
        InstrumentTuning::new("bass-5", "Bass 5-string", &["B0", "E1", "A1", "D2", "G2"]),
        InstrumentTuning::new(
            "bass-6",
            "Bass 6-string",
            &["B0", "E1", "A1", "D2", "G2", "C3"],
        ),
        InstrumentTuning::new("ukulele", "Ukulele (Standard C)", &["G4", "C4", "E4", "A4"]),
        InstrumentTuning::new("violin", "Violin", &["G3", "D4", "A4", "E5"]),
    ]
});

static BY_ID: Lazy<BTreeMap<&'static str, usize>> = Lazy::new(|| {
    TUNINGS
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id, i))
        .collect()
});

/// Every available preset, chromatic first.
pub fn all() -> &'static [InstrumentTuning] {
    &TUNINGS
}

/// Looks up a preset by id, e.g. `"guitar-standard"`.
pub fn find(id: &str) -> Option<&'static InstrumentTuning> {
    BY_ID.get(id).map(|&i| &TUNINGS[i])
}

/// Re-expresses a detection against an explicit target pitch.
///
/// Unlike [`DetectedNote::cents`] this is not bounded to +/-50 cents.
pub fn cents_from_target(note: &DetectedNote, target: Pitch, reference: f32) -> Option<f32> {
    let target_freq = target.frequency(reference)?;
    if target_freq <= f32::EPSILON || note.frequency <= f32::EPSILON {
        return None;
    }
    Some(calculate_cents_deviation(note.frequency, target_freq))
}

pub fn is_in_tune(cents: f32) -> bool {
    cents.abs() <= IN_TUNE_CENTS
}
