//! # loopstream
//!
//! Plays an audio file through the streaming engine, optionally looping it
//! gaplessly, and prints the playback position once per second.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use loopstream_audio::output::{default_device_name, list_output_devices};
use loopstream_audio::{AudioEngine, DecoderFactory, EngineEvent, FfmpegDecoder, SymphoniaDecoder};
use loopstream_core::{EngineConfig, Error, StreamInfo};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Decoder backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Streaming decode with symphonia at the file's native rate
    Symphonia,
    /// Whole-file decode through the ffmpeg binary, resampled to the output rate
    Ffmpeg,
}

/// Command-line arguments for loopstream
#[derive(Parser, Debug)]
#[command(name = "loopstream")]
#[command(about = "Gapless, seekable streaming audio player")]
#[command(version)]
struct Args {
    /// Audio file to play
    #[arg(required_unless_present = "list_devices")]
    file: Option<PathBuf>,

    /// Loop the file seamlessly until interrupted
    #[arg(short, long = "loop")]
    looping: bool,

    /// JSON engine configuration
    #[arg(short, long, env = "LOOPSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Decoder backend
    #[arg(short, long, value_enum, default_value_t = Backend::Symphonia)]
    decoder: Backend,

    /// Start position in seconds
    #[arg(short, long)]
    seek: Option<f64>,

    /// Chunks to keep queued ahead of the output
    #[arg(short, long)]
    prebuffer: Option<usize>,

    /// Force the output sample rate
    #[arg(long)]
    sample_rate: Option<u32>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loopstream=info,loopstream_audio=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting loopstream v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        let default = default_device_name();
        for name in list_output_devices().context("Failed to list output devices")? {
            let marker = if default.as_deref() == Some(name.as_str()) { "*" } else { " " };
            println!("{marker} {name}");
        }
        return Ok(());
    }

    let Some(file) = args.file.as_deref() else {
        bail!("No file given");
    };

    let config = load_config(&args)?;
    let (engine, stream) = start(config, args.decoder, file)?;
    println!(
        "{}: {:.2}s, {} Hz, {} channels",
        file.display(),
        stream.duration,
        stream.sample_rate,
        stream.channels
    );

    engine.set_loop(args.looping)?;
    if let Some(seconds) = args.seek {
        engine
            .seek(seconds)
            .with_context(|| format!("Cannot start at {seconds:.2}s"))?;
    }
    engine.play()?;

    run(&engine)
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(prebuffer) = args.prebuffer {
        config.prebuffer_chunks = prebuffer;
        // Keep room in the message ring for the deeper queue.
        config.message_capacity = config
            .message_capacity
            .max(config.render_queue_capacity() * 2);
    }
    if args.sample_rate.is_some() {
        config.output_sample_rate = args.sample_rate;
    }

    config.validate()?;
    Ok(config)
}

fn factory(backend: Backend) -> DecoderFactory {
    match backend {
        Backend::Symphonia => SymphoniaDecoder::factory(),
        Backend::Ffmpeg => FfmpegDecoder::factory(),
    }
}

/// Start the engine and open `file`.
///
/// Without a forced output rate, a file at a different rate restarts the
/// engine at the file's rate instead of failing.
fn start(mut config: EngineConfig, backend: Backend, file: &Path) -> Result<(AudioEngine, StreamInfo)> {
    let engine = AudioEngine::new(config.clone(), factory(backend))
        .context("Failed to initialize playback engine")?;

    match engine.open(file) {
        Ok(stream) => Ok((engine, stream)),
        Err(Error::SampleRateMismatch { native, required }) if config.output_sample_rate.is_none() => {
            warn!("File is {native} Hz, output is {required} Hz; reopening output at {native} Hz");
            drop(engine);
            config.output_sample_rate = Some(native);
            let engine = AudioEngine::new(config, factory(backend))
                .with_context(|| format!("Output device cannot run at {native} Hz"))?;
            let stream = engine
                .open(file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            Ok((engine, stream))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open {}", file.display())),
    }
}

/// Print the position once per second until playback ends.
fn run(engine: &AudioEngine) -> Result<()> {
    let mut last_print = Instant::now();
    let duration = engine.duration();

    loop {
        let timeout = Duration::from_secs(1).saturating_sub(last_print.elapsed());
        match engine.recv_event_timeout(timeout) {
            Some(EngineEvent::Ended) => {
                println!("{:>8.2}s / {:.2}s  (end)", engine.current_time(), duration);
                return Ok(());
            }
            Some(EngineEvent::Error(message)) => warn!("Engine error: {message}"),
            Some(EngineEvent::LoopRestarted) => info!("Loop restarted"),
            _ => {}
        }

        if last_print.elapsed() >= Duration::from_secs(1) {
            println!("{:>8.2}s / {:.2}s", engine.current_time(), duration);
            last_print = Instant::now();
        }
    }
}
