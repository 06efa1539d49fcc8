//! Create window shards for one video
//!
//! Usage: create_shards <video> [--config cfg.json] [--seq-len N] [--stride N] [--workers N]
//!
//! `<video>` is a video file (needs the `opencv` feature) or a directory of
//! frame images. Detections are replayed from `<root>/<video_id>/json/pose.json`.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use dstg_windowing::{create_shards, FlowEstimator, LucasKanadeFlow, WindowConfig};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FlowMethod {
    /// Dense Lucas-Kanade, pure Rust
    LucasKanade,
    /// OpenCV Farneback (requires the `opencv` feature)
    Farneback,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract fixed-stride windows from a video into tar shards", long_about = None)]
struct Args {
    /// Video file, or a directory of frames with --image-dir
    video: PathBuf,

    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Window length in frames
    #[arg(long)]
    seq_len: Option<usize>,

    /// Frames between window starts
    #[arg(long)]
    stride: Option<usize>,

    /// Number of window writer threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Fail when no producer makes progress for this long
    #[arg(long)]
    stall_timeout_ms: Option<u64>,

    /// Treat <VIDEO> as a directory of frame images
    #[arg(long)]
    image_dir: bool,

    /// Optical flow estimator
    #[arg(long, value_enum, default_value_t = FlowMethod::LucasKanade)]
    flow: FlowMethod,

    /// Lucas-Kanade window radius in pixels
    #[arg(long, default_value_t = 2)]
    flow_radius: usize,
}

fn flow_estimator(args: &Args) -> anyhow::Result<Box<dyn FlowEstimator>> {
    match args.flow {
        FlowMethod::LucasKanade => Ok(Box::new(LucasKanadeFlow::new(args.flow_radius))),
        #[cfg(feature = "opencv")]
        FlowMethod::Farneback => Ok(Box::new(dstg_windowing::FarnebackFlow::default())),
        #[cfg(not(feature = "opencv"))]
        FlowMethod::Farneback => bail!("--flow farneback needs the `opencv` feature"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WindowConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WindowConfig::default(),
    };
    if let Some(seq_len) = args.seq_len {
        config.seq_len = seq_len;
    }
    if let Some(stride) = args.stride {
        config.stride = stride;
    }
    if args.workers.is_some() {
        config.num_workers = args.workers;
    }
    if args.stall_timeout_ms.is_some() {
        config.stall_timeout_ms = args.stall_timeout_ms;
    }
    config.validate()?;

    if args.image_dir && !args.video.is_dir() {
        bail!("{} is not a directory", args.video.display());
    }
    if !args.image_dir && args.video.is_dir() {
        log::info!("{} is a directory, reading it as frames", args.video.display());
    }

    let estimator = flow_estimator(&args)?;
    let report = create_shards(&args.video, &config, estimator, None)
        .with_context(|| format!("creating shards for {}", args.video.display()))?;

    print!("{}", report);
    for shard in &report.shards {
        println!("  {}", shard.display());
    }
    if !report.failed.is_empty() {
        bail!("{} of {} windows failed", report.failed.len(), report.windows_expected);
    }
    Ok(())
}
