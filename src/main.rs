/// Double-clap detection service binary
///
/// Listens on the microphone (or replays a WAV file) and emits one trigger
/// per double clap. With `--calibrate` it measures the room instead and
/// recommends thresholds.

use anyhow::{Context, Result};
use clap::Parser;
use clap_detector::config::{DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE};
use clap_detector::{
    CalibrationConfig, CalibrationEngine, CalibrationOutcome, ChannelSink, DetectorConfig,
    DetectorError, DetectorStats, DoubleClapDetector, FrameSource, FrameSourceError,
    MicrophoneSource, ThresholdConfig, ThresholdPolicy, WavSource,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "clap-detector",
    version,
    about = "Detects two claps in a row on the microphone and emits a trigger"
)]
struct Args {
    /// Measure ambient noise and a clap exercise instead of detecting
    #[arg(long, env = "CLAP_CALIBRATE")]
    calibrate: bool,

    /// Threshold profile (JSON) to start from
    #[arg(long, env = "CLAP_PROFILE")]
    profile: Option<PathBuf>,

    /// Where calibration writes the recommended profile
    #[arg(long, requires = "calibrate")]
    save_profile: Option<PathBuf>,

    /// Replay a WAV file instead of capturing from the microphone
    #[arg(long, env = "CLAP_INPUT_WAV")]
    input: Option<PathBuf>,

    /// Input device name (defaults to the host default)
    #[arg(long, env = "CLAP_DEVICE")]
    device: Option<String>,

    #[arg(long, env = "SAMPLE_RATE", default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Samples per frame
    #[arg(long, env = "BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    #[arg(long, env = "CLAP_THRESHOLD")]
    clap_threshold: Option<f32>,

    #[arg(long, env = "SILENCE_THRESHOLD")]
    silence_threshold: Option<f32>,

    #[arg(long, env = "MIN_CLAP_GAP_MS")]
    min_clap_gap_ms: Option<u64>,

    #[arg(long, env = "MAX_CLAP_GAP_MS")]
    max_clap_gap_ms: Option<u64>,

    /// Enables the ambient-relative threshold
    #[arg(long, env = "CLAP_MULTIPLIER")]
    clap_multiplier: Option<f32>,

    #[arg(long, env = "AMBIENT_NOISE_LEVEL")]
    ambient_noise_level: Option<f32>,

    /// Quiet period after a trigger
    #[arg(long, env = "CLAP_COOLDOWN_MS", default_value_t = 500)]
    cooldown_ms: u64,

    #[arg(long, default_value_t = 5)]
    noise_secs: u64,

    #[arg(long, default_value_t = 15)]
    exercise_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("clap_detector=info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current frame");
            token.cancel();
        }
    });

    if args.calibrate {
        run_calibration(&args, config, shutdown).await
    } else {
        run_detection(&args, config, shutdown).await
    }
}

/// Defaults, then the profile, then explicit flags/environment
fn build_config(args: &Args) -> Result<DetectorConfig> {
    let mut config = DetectorConfig::default();

    if let Some(path) = &args.profile {
        config.thresholds = ThresholdConfig::load_profile(path)?;
    }

    config.audio.sample_rate = args.sample_rate;
    config.audio.block_size = args.block_size;
    config.audio.device = args.device.clone();
    config.cooldown_ms = args.cooldown_ms;

    let thresholds = &mut config.thresholds;
    if let Some(value) = args.clap_threshold {
        thresholds.clap_threshold = value;
    }
    if let Some(value) = args.silence_threshold {
        thresholds.silence_threshold = value;
    }
    if let Some(value) = args.min_clap_gap_ms {
        thresholds.min_clap_gap_ms = value;
    }
    if let Some(value) = args.max_clap_gap_ms {
        thresholds.max_clap_gap_ms = value;
    }

    let profile_ambient = match thresholds.policy {
        ThresholdPolicy::Adaptive {
            ambient_noise_level,
            ..
        } => Some(ambient_noise_level),
        ThresholdPolicy::Absolute => None,
    };
    if let Some(clap_multiplier) = args.clap_multiplier {
        thresholds.policy = ThresholdPolicy::Adaptive {
            clap_multiplier,
            ambient_noise_level: args.ambient_noise_level.or(profile_ambient).unwrap_or(0.0),
        };
    } else if let (Some(level), ThresholdPolicy::Adaptive { clap_multiplier, .. }) =
        (args.ambient_noise_level, thresholds.policy)
    {
        thresholds.policy = ThresholdPolicy::Adaptive {
            clap_multiplier,
            ambient_noise_level: level,
        };
    } else if args.ambient_noise_level.is_some() {
        warn!("AMBIENT_NOISE_LEVEL has no effect without a clap multiplier");
    }

    // replayed audio runs on media time; nothing to wait for between frames
    if args.input.is_some() {
        config.idle_poll_ms = 0;
    }

    Ok(config)
}

fn open_source(
    config: &DetectorConfig,
    input: Option<&Path>,
) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    match input {
        Some(path) => Ok(Box::new(WavSource::open(path, config.audio.block_size)?)),
        None => Ok(Box::new(MicrophoneSource::open(&config.audio)?)),
    }
}

async fn run_detection(
    args: &Args,
    config: DetectorConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting double-clap detection service");

    let (mut sink, mut events) = ChannelSink::channel();
    let input = args.input.clone();

    // the capture stream is not Send; open it on the blocking thread that reads it
    let worker =
        tokio::task::spawn_blocking(move || -> Result<DetectorStats, DetectorError> {
            let mut detector = DoubleClapDetector::new(&config)?;
            let mut source = open_source(&config, input.as_deref())?;
            detector.run(&mut source, &mut sink, &shutdown)
        });

    while let Some(event) = events.recv().await {
        info!(
            "Trigger: double clap at {:?} (gap {}ms)",
            event.timestamp,
            event.gap.as_millis()
        );
        println!("{}", serde_json::to_string(&event)?);
    }

    let stats = worker.await.context("Detector task panicked")??;
    info!(
        "Detector stopped: {} frames, {} double claps, {} timeouts, {} overflows, {} samples dropped",
        stats.frames_processed,
        stats.double_claps,
        stats.timeouts,
        stats.overflows,
        stats.dropped_samples
    );

    Ok(())
}

async fn run_calibration(
    args: &Args,
    config: DetectorConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting calibration");

    let calibration = CalibrationConfig {
        noise_duration: Duration::from_secs(args.noise_secs),
        exercise_duration: Duration::from_secs(args.exercise_secs),
        ..Default::default()
    };
    let engine = CalibrationEngine::new(calibration, config.thresholds.clone());
    let input = args.input.clone();

    let outcome = tokio::task::spawn_blocking(move || -> Result<CalibrationOutcome> {
        let mut source = open_source(&config, input.as_deref())?;
        Ok(engine.run(&mut source, &shutdown)?)
    })
    .await
    .context("Calibration task panicked")??;

    match outcome {
        CalibrationOutcome::Recommended(report) => {
            println!("{}", report);

            if let Some(path) = &args.save_profile {
                let profile = report
                    .recommended_config()
                    .context("Recommended thresholds failed validation")?;
                profile.save_profile(path)?;
            }
        }
        CalibrationOutcome::NoClapsDetected { noise, exercise } => {
            println!(
                "No claps detected: loudest peak {:.4} did not rise above the noise floor (max {:.4})",
                exercise.max_clap_seen, noise.max
            );
        }
    }

    Ok(())
}
