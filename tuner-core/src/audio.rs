//! # Audio Capture Module
//!
//! The engine talks to the capture device through [`AudioCapture`]. This
//! module defines that boundary and provides [`CpalCapture`], an
//! implementation on top of CPAL (Cross-Platform Audio Library).
//!
//! ## Features
//! - Exclusive (fixed device buffer) and shared (device default buffer) modes
//! - Fixed-length blocks regardless of the device callback size
//! - Down-mixing of multi-channel devices to mono
//! - The `cpal::Stream` lives and dies on its own owner thread

use crate::AudioBlock;
use crate::error::CaptureError;
use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SupportedBufferSize, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use std::thread::{self, JoinHandle};

/// How the device should be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Low-latency acquisition with a device buffer equal to the block length.
    Exclusive,
    /// Device default buffering; samples are re-blocked in software.
    Shared,
}

/// Stream parameters requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub sample_rate: u32,
    pub block_length: usize,
}

/// Returned by the block callback to tell the device whether to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockControl {
    Continue,
    Stop,
}

pub type BlockCallback = Box<dyn FnMut(&AudioBlock<'_>) -> BlockControl + Send>;
pub type ErrorCallback = Box<dyn FnMut(CaptureError) + Send>;

/// Callbacks registered with the device for one stream.
pub struct CaptureCallbacks {
    pub on_block: BlockCallback,
    pub on_error: ErrorCallback,
}

/// An open capture stream.
pub trait CaptureHandle: Send {
    /// The sample rate the device actually runs at.
    fn sample_rate(&self) -> u32;

    fn mode(&self) -> ShareMode;

    /// Stops the device and waits until no callback can run anymore.
    fn close(self: Box<Self>);
}

/// Anything that can open a mono `f32` input stream.
///
/// After reporting an error through `on_error` the implementation must
/// release the device by itself; `close` is still called exactly once.
pub trait AudioCapture: Send + Sync {
    fn open(
        &self,
        request: &CaptureRequest,
        mode: ShareMode,
        callbacks: CaptureCallbacks,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// Captures from a CPAL input device.
#[derive(Debug, Clone, Default)]
pub struct CpalCapture {
    device_name: Option<String>,
}

impl CpalCapture {
    /// Uses the host's default input device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the first input device whose name contains `name`.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    /// Names of all input devices on the default host.
    pub fn input_device_names() -> Result<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()?
            .filter_map(|d| d.name().ok())
            .collect())
    }
}

impl AudioCapture for CpalCapture {
    fn open(
        &self,
        request: &CaptureRequest,
        mode: ShareMode,
        callbacks: CaptureCallbacks,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32, CaptureError>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let error_shutdown_tx = shutdown_tx.clone();
        let request = *request;
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("tuner-audio".into())
            .spawn(move || {
                run_stream_owner(
                    device_name.as_deref(),
                    request,
                    mode,
                    callbacks,
                    ready_tx,
                    shutdown_rx,
                    error_shutdown_tx,
                )
            })
            .map_err(|e| CaptureError::Build(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Box::new(CpalHandle {
                shutdown_tx,
                thread: Some(thread),
                sample_rate,
                mode,
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::WorkerGone)
            }
        }
    }
}

/// Body of the stream owner thread.
///
/// Builds and starts the stream, reports the outcome, then parks until it is
/// told to shut down either by `close` or by the stream's error callback.
fn run_stream_owner(
    device_name: Option<&str>,
    request: CaptureRequest,
    mode: ShareMode,
    callbacks: CaptureCallbacks,
    ready_tx: Sender<Result<u32, CaptureError>>,
    shutdown_rx: Receiver<()>,
    error_shutdown_tx: Sender<()>,
) {
    let built = select_device(device_name)
        .and_then(|device| build_stream(&device, &request, mode, callbacks, error_shutdown_tx));
    let (stream, sample_rate) = match built {
        Ok(built) => built,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::Play(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(sample_rate));

    let _ = shutdown_rx.recv();

    if let Err(e) = stream.pause() {
        warn!("Error pausing stream: {e}");
    }
    drop(stream);
    info!("Audio stream released");
}

fn select_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)))
            .ok_or(CaptureError::NoDevice),
    }
}

fn build_stream(
    device: &cpal::Device,
    request: &CaptureRequest,
    mode: ShareMode,
    callbacks: CaptureCallbacks,
    error_shutdown_tx: Sender<()>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let device_name = device.name().unwrap_or_else(|_| "<unknown>".into());
    info!("Using audio input device: {device_name} ({mode:?} mode)");

    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?
        .collect::<Vec<_>>();
    let config = stream_config(configs, request, mode)
        .map_err(|e| CaptureError::UnsupportedConfig(format!("{e:#}")))?;

    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let block_length = request.block_length;
    info!(
        "Stream config: {sample_rate} Hz, {channels} channel(s), buffer {:?}",
        config.buffer_size
    );

    let CaptureCallbacks {
        mut on_block,
        mut on_error,
    } = callbacks;

    // This buffer accumulates audio data from the callback until a full block is available.
    let mut pending: Vec<f32> = Vec::with_capacity(block_length * 4);
    let mut stopped = false;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if stopped {
                    return;
                }
                if channels == 1 {
                    pending.extend_from_slice(data);
                } else {
                    pending.extend(
                        data.chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                }

                while pending.len() >= block_length {
                    let block = AudioBlock {
                        samples: &pending[..block_length],
                        sample_rate,
                    };
                    if on_block(&block) == BlockControl::Stop {
                        stopped = true;
                        pending.clear();
                        return;
                    }
                    pending.drain(..block_length);
                }
            },
            move |err| {
                error!("An error occurred on the audio stream: {err}");
                on_error(CaptureError::Stream(err.to_string()));
                let _ = error_shutdown_tx.try_send(());
            },
            None,
        )
        .map_err(|e| CaptureError::Build(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Picks a stream configuration for the request.
///
/// Prefers mono `f32` configurations and the sample rate closest to the
/// request. In exclusive mode the device must accept a fixed buffer of
/// exactly one block.
fn stream_config(
    configs: Vec<SupportedStreamConfigRange>,
    request: &CaptureRequest,
    mode: ShareMode,
) -> Result<cpal::StreamConfig> {
    let supported = find_supported_config(configs, request.sample_rate)
        .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

    let rate = request.sample_rate.clamp(
        supported.min_sample_rate().0,
        supported.max_sample_rate().0,
    );
    let buffer_size = match mode {
        ShareMode::Shared => cpal::BufferSize::Default,
        ShareMode::Exclusive => {
            let frames = u32::try_from(request.block_length)?;
            match supported.buffer_size() {
                SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => {
                    cpal::BufferSize::Fixed(frames)
                }
                other => {
                    return Err(anyhow!(
                        "device cannot run a fixed buffer of {frames} frames ({other:?})"
                    ));
                }
            }
        }
    };

    let mut config = supported.with_sample_rate(cpal::SampleRate(rate)).config();
    config.buffer_size = buffer_size;
    Ok(config)
}

/// Finds the best supported audio configuration for the target sample rate.
///
/// Mono configurations win over multi-channel ones, then the closest sample
/// rate wins.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let (min, max) = (c.min_sample_rate().0, c.max_sample_rate().0);
            let rate_diff = if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            };
            (c.channels() != 1, rate_diff)
        })
}

struct CpalHandle {
    shutdown_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    mode: ShareMode,
}

impl CpalHandle {
    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio owner thread panicked");
            }
        }
    }
}

impl CaptureHandle for CpalHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn mode(&self) -> ShareMode {
        self.mode
    }

    fn close(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
