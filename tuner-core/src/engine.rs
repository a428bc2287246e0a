//! # Engine Controller
//!
//! Owns the tuner lifecycle and the per-block pipeline.
//!
//! ## Architecture
//! - **Control context**: `start`, `stop` and `set_reference_pitch` are called
//!   from any host thread and serialise on a short mutex around the open stream.
//! - **Audio context**: the capture device calls into a [`BlockProcessor`]
//!   that it owns exclusively. It reads the engine state and the reference
//!   pitch through atomics and never takes a lock.
//! - **Teardown**: `stop` flips the state first, waits until no block is in
//!   flight, and only then closes the stream.

use crate::AudioBlock;
use crate::audio::{
    AudioCapture, BlockControl, CaptureCallbacks, CaptureHandle, CaptureRequest, ShareMode,
};
use crate::config::TunerConfig;
use crate::error::{CaptureError, ConfigError, DeliveryError, StartError};
use crate::gate::NoiseGate;
use crate::pitch::{YinConfig, YinEstimator};
use crate::tuning::{NoteClassification, NoteMapper, ReferencePitch};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Faulted = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            3 => EngineState::Faulted,
            _ => EngineState::Idle,
        }
    }
}

/// Receives one classification per processed block.
///
/// Called on the audio thread, so implementations must not block for long.
/// A `stop` or `on_stream_error` issued from inside `deliver` cannot wait for
/// the stream to close; it only stops further notifications, and the host
/// must call `stop` again from a control thread to release the stream.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, classification: NoteClassification) -> Result<(), DeliveryError>;
}

/// Forwards classifications over a crossbeam channel without blocking.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<NoteClassification>,
}

impl ChannelSink {
    pub fn new(sender: Sender<NoteClassification>) -> Self {
        Self { sender }
    }
}

impl ResultSink for ChannelSink {
    fn deliver(&self, classification: NoteClassification) -> Result<(), DeliveryError> {
        self.sender.try_send(classification).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Disconnected(_) => DeliveryError::Disconnected,
        })
    }
}

/// State shared between the control context and the audio context.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    in_flight: AtomicUsize,
    reference: ReferencePitch,
    delivery_failures: AtomicU64,
}

impl Shared {
    #[inline]
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the engine faulted. Only a running engine can fault.
    fn fault(&self, error: &CaptureError) {
        if self.transition(EngineState::Running, EngineState::Faulted) {
            error!("Audio stream failed, engine faulted: {error}");
        } else {
            debug!("Ignoring stream error while {:?}: {error}", self.state());
        }
    }

    /// Spins until every block that entered the pipeline has left it.
    fn drain(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            std::thread::yield_now();
        }
    }
}

thread_local! {
    /// Set while the current thread is inside `BlockProcessor::on_block`.
    static IN_BLOCK: Cell<bool> = const { Cell::new(false) };
}

fn in_audio_context() -> bool {
    IN_BLOCK.with(Cell::get)
}

/// Counts a block as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        IN_BLOCK.with(|flag| flag.set(true));
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        IN_BLOCK.with(|flag| flag.set(false));
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The audio-context half of the engine.
///
/// Owned by the capture callback; holds the preallocated YIN work buffer.
pub struct BlockProcessor {
    shared: Arc<Shared>,
    gate: NoiseGate,
    yin: YinEstimator,
    mapper: NoteMapper,
    sink: Arc<dyn ResultSink>,
}

impl BlockProcessor {
    fn new(shared: Arc<Shared>, config: &TunerConfig, sink: Arc<dyn ResultSink>) -> Self {
        let yin_config = YinConfig {
            threshold: config.yin_threshold,
            min_frequency: config.min_frequency,
            max_frequency: config.max_frequency,
        };
        Self {
            shared,
            gate: NoiseGate::new(config.rms_threshold),
            yin: YinEstimator::new(yin_config, config.block_length),
            mapper: NoteMapper::new(config.min_frequency),
            sink,
        }
    }

    /// Runs one block through the pipeline and delivers exactly one result.
    ///
    /// Blocks arriving while the engine is not running are dropped and the
    /// device is asked to stop.
    pub fn on_block(&mut self, block: &AudioBlock<'_>) -> BlockControl {
        let Self {
            shared,
            gate,
            yin,
            mapper,
            sink,
        } = self;

        let _in_flight = InFlight::enter(&shared.in_flight);
        if shared.state() != EngineState::Running {
            return BlockControl::Stop;
        }

        let classification = analyse(gate, yin, mapper, shared.reference.get(), block);

        // A stop issued while analysing wins over the notification.
        if shared.state() != EngineState::Running {
            return BlockControl::Stop;
        }
        if let Err(e) = sink.deliver(classification) {
            let failures = shared.delivery_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures == 1 || failures % 100 == 0 {
                warn!("Result delivery failed ({failures} so far): {e}");
            }
        }
        BlockControl::Continue
    }
}

fn analyse(
    gate: &NoiseGate,
    yin: &mut YinEstimator,
    mapper: &NoteMapper,
    reference: f32,
    block: &AudioBlock<'_>,
) -> NoteClassification {
    if !gate.passes(block.samples) {
        return NoteClassification::Unavailable;
    }
    match yin.estimate(block.samples, block.sample_rate) {
        Some(frequency) => {
            trace!("Detected {frequency:.2} Hz");
            mapper.classify(frequency, reference)
        }
        None => NoteClassification::Unavailable,
    }
}

/// Owns the engine lifecycle and the open capture stream.
pub struct EngineController {
    capture: Box<dyn AudioCapture>,
    config: TunerConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<Box<dyn CaptureHandle>>>,
}

impl EngineController {
    /// Creates an idle engine. The configuration is validated here.
    pub fn new(capture: Box<dyn AudioCapture>, config: TunerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: AtomicU8::new(EngineState::Idle as u8),
            in_flight: AtomicUsize::new(0),
            reference: ReferencePitch::new(config.reference_pitch)?,
            delivery_failures: AtomicU64::new(0),
        });
        Ok(Self {
            capture,
            config,
            shared,
            active: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn reference_pitch(&self) -> f32 {
        self.shared.reference.get()
    }

    /// Number of classifications the sink refused since the engine was created.
    pub fn delivery_failures(&self) -> u64 {
        self.shared.delivery_failures.load(Ordering::Relaxed)
    }

    /// Mode of the open stream, if any.
    pub fn share_mode(&self) -> Option<ShareMode> {
        self.lock_active().as_ref().map(|h| h.mode())
    }

    /// Changes the A4 reference. Safe to call in any state.
    ///
    /// Out-of-range values are rejected and the previous reference is kept.
    pub fn set_reference_pitch(&self, hz: f32) -> Result<(), ConfigError> {
        self.shared.reference.set(hz)?;
        info!("Reference pitch set to {hz} Hz");
        Ok(())
    }

    /// Opens the capture stream and starts delivering results to `sink`.
    ///
    /// Tries the exclusive mode first and falls back to the shared mode once.
    pub fn start(
        &self,
        sample_rate: u32,
        block_length: usize,
        sink: Arc<dyn ResultSink>,
    ) -> Result<(), StartError> {
        let mut active = self.lock_active();

        match self.state() {
            EngineState::Idle => {}
            EngineState::Running | EngineState::Stopping => {
                warn!("Engine already running, start ignored");
                return Err(StartError::AlreadyRunning);
            }
            EngineState::Faulted => {
                warn!("Engine faulted, stop it before starting again");
                return Err(StartError::Faulted);
            }
        }

        let config = TunerConfig {
            sample_rate,
            block_length,
            reference_pitch: self.shared.reference.get(),
            ..self.config.clone()
        };
        config.validate()?;
        let request = CaptureRequest {
            sample_rate,
            block_length,
        };

        info!("Starting engine: {sample_rate} Hz, {block_length} frames per block");
        // Running before the device opens, so the first callback is not dropped.
        self.shared.set_state(EngineState::Running);

        let exclusive = match self.open(&request, ShareMode::Exclusive, &config, &sink) {
            Ok(handle) => {
                info!("Opened stream in exclusive mode at {} Hz", handle.sample_rate());
                *active = Some(handle);
                return Ok(());
            }
            Err(e) => e,
        };
        warn!("Exclusive stream failed ({exclusive}), trying shared mode...");

        match self.open(&request, ShareMode::Shared, &config, &sink) {
            Ok(handle) => {
                info!("Opened stream in shared mode at {} Hz", handle.sample_rate());
                *active = Some(handle);
                Ok(())
            }
            Err(shared) => {
                error!("Shared stream also failed: {shared}");
                self.shared.set_state(EngineState::Idle);
                Err(StartError::Capture { exclusive, shared })
            }
        }
    }

    fn open(
        &self,
        request: &CaptureRequest,
        mode: ShareMode,
        config: &TunerConfig,
        sink: &Arc<dyn ResultSink>,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let mut processor = BlockProcessor::new(Arc::clone(&self.shared), config, Arc::clone(sink));
        let shared = Arc::clone(&self.shared);
        let callbacks = CaptureCallbacks {
            on_block: Box::new(move |block: &AudioBlock<'_>| processor.on_block(block)),
            on_error: Box::new(move |e: CaptureError| shared.fault(&e)),
        };
        self.capture.open(request, mode, callbacks)
    }

    /// Stops the engine and releases the stream. Idempotent.
    ///
    /// Returns once no block can produce another notification.
    ///
    /// Called from inside a [`ResultSink`], it only moves the engine to
    /// `Stopping`; a later `stop` from a control thread releases the stream.
    pub fn stop(&self) {
        if in_audio_context() {
            if self.shared.transition(EngineState::Running, EngineState::Stopping) {
                warn!("stop() called from the audio thread, stream stays open");
            }
            return;
        }
        let mut active = self.lock_active();
        let state = self.state();

        if state == EngineState::Idle {
            debug!("Engine not running, stop ignored");
            return;
        }

        info!("Stopping engine...");
        self.shared.set_state(EngineState::Stopping);
        self.shared.drain();
        if let Some(handle) = active.take() {
            handle.close();
        }
        self.shared.set_state(EngineState::Idle);
        info!("Engine stopped");
    }

    /// Reports an unrecoverable stream error from outside the device callbacks.
    ///
    /// The engine faults and releases the stream; `stop` returns it to idle.
    pub fn on_stream_error(&self, error: CaptureError) {
        if in_audio_context() {
            self.shared.fault(&error);
            return;
        }
        let mut active = self.lock_active();
        self.shared.fault(&error);
        if self.state() != EngineState::Faulted {
            return;
        }
        self.shared.drain();
        if let Some(handle) = active.take() {
            handle.close();
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Box<dyn CaptureHandle>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.stop();
    }
}
