// SPDX-License-Identifier: GPL-3.0-only

use clap::Parser;
use rawenc::config::Config;
use rawenc::constants;
use rawenc::media::PacketSink;
use rawenc::pipelines::CapturePipeline;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rawenc")]
#[command(about = "Capture raw camera frames and write an encoded stream to stdout or a file")]
#[command(version = constants::app_version())]
struct Cli {
    /// Config file (default: ~/.config/rawenc/config.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture device node
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Requested frame width
    #[arg(long)]
    width: Option<u32>,

    /// Requested frame height
    #[arg(long)]
    height: Option<u32>,

    /// Number of memory-mapped capture buffers
    #[arg(long)]
    buffers: Option<u32>,

    /// FFmpeg encoder name
    #[arg(long)]
    codec: Option<String>,

    /// Frame rate of the encoded stream (sets the time base, not the device rate)
    #[arg(long)]
    fps: Option<u32>,

    /// Encoder preset (x264/x265 only)
    #[arg(long)]
    preset: Option<String>,

    /// Encoder tune (x264/x265 only)
    #[arg(long)]
    tune: Option<String>,

    /// Constant rate factor (x264/x265 only)
    #[arg(long)]
    crf: Option<u32>,

    /// Average bitrate in bits per second
    #[arg(long)]
    bitrate: Option<u64>,

    /// Group of pictures size
    #[arg(long)]
    gop_size: Option<u32>,

    /// Maximum consecutive B-frames
    #[arg(long)]
    b_frames: Option<u32>,

    /// Output file, directory, or `-` for stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Command-line values override the config file
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(width) = self.width {
            config.camera.width = width;
            config.encoder.width = width;
        }
        if let Some(height) = self.height {
            config.camera.height = height;
            config.encoder.height = height;
        }
        if let Some(buffers) = self.buffers {
            config.camera.buffer_count = buffers;
        }
        if let Some(codec) = &self.codec {
            config.encoder.codec = codec.clone();
        }
        if let Some(fps) = self.fps {
            config.encoder.fps = fps;
        }
        if self.preset.is_some() {
            config.encoder.preset = self.preset.clone();
        }
        if self.tune.is_some() {
            config.encoder.tune = self.tune.clone();
        }
        if self.crf.is_some() {
            config.encoder.crf = self.crf;
        }
        if self.bitrate.is_some() {
            config.encoder.bitrate = self.bitrate;
        }
        if self.gop_size.is_some() {
            config.encoder.gop_size = self.gop_size;
        }
        if self.b_frames.is_some() {
            config.encoder.b_frames = self.b_frames;
        }
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file.clone();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    init_logging(config.log_file.as_deref())?;
    info!(version = constants::app_version(), "rawenc starting");

    run(&config, cli.duration.map(Duration::from_secs))
}

/// Logs never go to stdout, which may carry the encoded stream.
/// Set RUST_LOG to control the level (default: info).
fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

fn run(config: &Config, duration: Option<Duration>) -> Result<(), Box<dyn std::error::Error>> {
    let sink = PacketSink::open(&config.output)?;
    let sink_stats = sink.stats();
    info!(device = %config.device.display(), output = sink.destination(), "Preparing capture");

    let mut pipeline = CapturePipeline::v4l2(&config.device);
    pipeline.set_packet_handler(sink.into_handler())?;
    let geometry = pipeline.configure(&config.camera, &config.encoder)?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    pipeline.start()?;
    info!(geometry = %geometry, "Capturing, press Ctrl+C to stop");

    let started = Instant::now();
    while !stop_flag.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Capture duration reached");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    pipeline.stop();
    let flushed = pipeline.finalize();

    let capture = pipeline.capture_stats();
    let encoder = pipeline.encoder_stats();
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        frames_captured = capture.frames_delivered,
        frames_encoded = encoder.frames_encoded,
        frames_dropped = encoder.frames_dropped,
        frames_discarded = encoder.frames_discarded,
        packets = encoder.packets_emitted,
        flushed,
        bytes_written = sink_stats.bytes_written(),
        "Capture finished"
    );
    if sink_stats.write_errors() > 0 {
        warn!(errors = sink_stats.write_errors(), "Some packets could not be written");
    }

    Ok(())
}
