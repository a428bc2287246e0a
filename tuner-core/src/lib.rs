// tuner-core/src/lib.rs

//! The core logic for the real-time instrument tuner.
//! This crate is responsible for noise gating, YIN pitch detection,
//! note classification and the engine lifecycle. It is completely headless
//! and contains no UI code.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod instruments;
pub mod pitch;
pub mod tuning;

pub use audio::{
    AudioCapture, BlockControl, CaptureCallbacks, CaptureHandle, CaptureRequest, CpalCapture,
    ShareMode,
};
pub use config::TunerConfig;
pub use engine::{BlockProcessor, ChannelSink, EngineController, EngineState, ResultSink};
pub use error::{CaptureError, ConfigError, DeliveryError, StartError};
pub use gate::NoiseGate;
pub use pitch::{YinConfig, YinEstimator};
pub use tuning::{DetectedNote, NoteClassification, NoteMapper, Pitch, ReferencePitch};

/// One block of mono audio handed to the engine by the capture device.
///
/// Borrowed for the duration of a single callback only.
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    /// Samples normalised to [-1.0, 1.0].
    pub samples: &'a [f32],
    /// The sample rate in Hz the block was captured at.
    pub sample_rate: u32,
}
