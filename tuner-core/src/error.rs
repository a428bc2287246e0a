//! # Error Types
//!
//! Every fallible operation in the core returns one of these values instead of
//! panicking. The audio path itself never produces an error: silence, short
//! blocks and undetected pitch are encoded as "unavailable" classifications.

use thiserror::Error;

/// A configuration value was rejected. The previous value stays in effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("reference pitch {0} Hz is outside the accepted range of 300-600 Hz")]
    ReferenceOutOfRange(f32),

    #[error("{name} must be a finite value in (0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("frequency range {min}-{max} Hz is invalid")]
    InvalidFrequencyRange { min: f32, max: f32 },

    #[error("block length {0} is too short to analyse")]
    InvalidBlockLength(usize),

    #[error("sample rate {0} Hz is not supported")]
    InvalidSampleRate(u32),
}

/// Errors reported by an audio-capture collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("no audio input device available")]
    NoDevice,

    #[error("unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("failed to build input stream: {0}")]
    Build(String),

    #[error("failed to start input stream: {0}")]
    Play(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("audio worker thread exited unexpectedly")]
    WorkerGone,
}

/// Why [`EngineController::start`](crate::engine::EngineController::start) failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StartError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is faulted; stop it before starting again")]
    Faulted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Both the exclusive attempt and the shared fallback failed.
    #[error("could not open audio stream (exclusive: {exclusive}; shared: {shared})")]
    Capture {
        exclusive: CaptureError,
        shared: CaptureError,
    },
}

/// A result sink could not accept a classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("result receiver is full")]
    Full,

    #[error("result receiver disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}
