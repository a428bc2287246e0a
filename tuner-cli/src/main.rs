//! # Tuner - Terminal Host
//!
//! Starts the tuner engine on an input device and prints the detected note
//! on a single, continuously updated status line.
//!
//! ## Architecture
//! - **Main Thread**: argument parsing, engine lifecycle and terminal output
//! - **Audio Thread**: owned by the capture backend, runs the analysis pipeline
//! - **Communication**: a bounded crossbeam channel carries one classification per block

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use log::{error, info, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tuner_core::config::validate_reference_pitch;
use tuner_core::instruments::{self, InstrumentTuning};
use tuner_core::{
    ChannelSink, CpalCapture, EngineController, EngineState, NoteClassification, Pitch,
    TunerConfig,
};

/// Classifications buffered between the audio thread and the terminal.
const RESULT_QUEUE_DEPTH: usize = 32;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Real-time chromatic and instrument tuner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write the effective configuration to this file before starting
    #[arg(long)]
    save_config: Option<PathBuf>,
    /// Requested input sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,
    /// Frames per analysis block
    #[arg(long)]
    block_length: Option<usize>,
    /// A4 reference pitch in Hz (300-600)
    #[arg(long)]
    reference: Option<f32>,
    /// RMS level below which a block counts as silence
    #[arg(long)]
    rms_threshold: Option<f32>,
    /// YIN absolute threshold
    #[arg(long)]
    yin_threshold: Option<f32>,
    /// Instrument preset id, see --list-instruments
    #[arg(long, default_value = instruments::CHROMATIC)]
    instrument: String,
    /// Fixed target note such as E2 or Bb3; overrides string auto-selection
    #[arg(long)]
    target: Option<Pitch>,
    /// Input device name (substring match); defaults to the system input
    #[arg(long)]
    device: Option<String>,
    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    seconds: Option<f64>,
    /// Print the instrument presets and input devices, then exit
    #[arg(long, default_value_t = false)]
    list_instruments: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.list_instruments {
        return list_instruments();
    }

    let config = build_config(&args)?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        info!("Saved configuration to {}", path.display());
    }

    let tuning = instruments::find(&args.instrument).ok_or_else(|| {
        anyhow!("unknown instrument '{}', try --list-instruments", args.instrument)
    })?;

    let capture = match &args.device {
        Some(name) => CpalCapture::with_device(name.as_str()),
        None => CpalCapture::new(),
    };
    let engine = EngineController::new(Box::new(capture), config.clone())
        .context("invalid tuner configuration")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl+C handler")?;
    }

    let (tx, rx) = crossbeam_channel::bounded(RESULT_QUEUE_DEPTH);
    engine
        .start(config.sample_rate, config.block_length, Arc::new(ChannelSink::new(tx)))
        .context("failed to start the tuner engine")?;

    println!(
        "Tuning {} at A4 = {} Hz. Press Ctrl+C to stop.",
        tuning.name,
        engine.reference_pitch()
    );

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if engine.state() == EngineState::Faulted {
            error!("Audio input failed, shutting down");
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(classification) => {
                let line = status_line(
                    &classification,
                    tuning,
                    args.target,
                    engine.reference_pitch(),
                );
                print!("\r{line:<60}");
                let _ = io::stdout().flush();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Engine dropped the result channel");
                break;
            }
        }
    }

    engine.stop();
    println!();
    if engine.delivery_failures() > 0 {
        info!("{} results were dropped by a full queue", engine.delivery_failures());
    }
    Ok(())
}

/// Starts from the config file, or defaults, and applies command-line overrides.
fn build_config(args: &Args) -> Result<TunerConfig> {
    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)?,
        None => TunerConfig::default(),
    };
    if let Some(sample_rate) = args.sample_rate {
        config.sample_rate = sample_rate;
    }
    if let Some(block_length) = args.block_length {
        config.block_length = block_length;
    }
    if let Some(rms) = args.rms_threshold {
        config.rms_threshold = rms;
    }
    if let Some(yin) = args.yin_threshold {
        config.yin_threshold = yin;
    }
    // An out-of-range value is reported and the file or default reference stays in effect.
    if let Some(reference) = args.reference {
        match validate_reference_pitch(reference) {
            Ok(()) => config.reference_pitch = reference,
            Err(e) => eprintln!("Ignoring --reference: {e}"),
        }
    }
    config.validate()?;
    Ok(config)
}

/// Formats one result. A fixed `target` wins over the instrument's strings.
fn status_line(
    classification: &NoteClassification,
    tuning: &InstrumentTuning,
    target: Option<Pitch>,
    reference: f32,
) -> String {
    let Some(note) = classification.note() else {
        return "--".to_string();
    };
    if target.is_none() && tuning.is_chromatic() {
        return classification.to_string();
    }

    let target = target.or_else(|| tuning.nearest_string(note.midi));
    match target.and_then(|t| Some((t, instruments::cents_from_target(note, t, reference)?))) {
        Some((target, cents)) => {
            let verdict = if instruments::is_in_tune(cents) {
                "in tune"
            } else if cents < 0.0 {
                "tune up"
            } else {
                "tune down"
            };
            format!(
                "target {target}: {cents:+.1} cents ({:.2} Hz) {verdict}",
                note.frequency
            )
        }
        None => format!("{classification} (no string nearby)"),
    }
}

fn list_instruments() -> Result<()> {
    println!("Instruments:");
    for tuning in instruments::all() {
        let strings = tuning
            .strings
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {:<18} {:<20} {}", tuning.id, tuning.name, strings);
    }

    println!("Input devices:");
    match CpalCapture::input_device_names() {
        Ok(names) if names.is_empty() => println!("  (none)"),
        Ok(names) => names.iter().for_each(|n| println!("  {n}")),
        Err(e) => warn!("Could not enumerate input devices: {e}"),
    }
    Ok(())
}
