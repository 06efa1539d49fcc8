//! End-to-end shard creation for one video
//!
//! [`create_shards`] resolves the on-disk layout of a video, picks the
//! tracking input (a recorded `pose.json` when present, else a live model),
//! and runs [`run_pipeline`]: two producer threads, the coordinator on the
//! calling thread, and the window writer pool.

use crate::config::WindowConfig;
use crate::coordinator::WindowCoordinator;
use crate::error::{Result, WindowingError};
use crate::flow::FlowEstimator;
use crate::frame_source::{FrameSource, ImageSequenceSource};
use crate::producer::{OpticalFlowProducer, SharedState, TrackingProducer};
use crate::progress::{Progress, ProgressSnapshot};
use crate::shard::ShardWriter;
use crate::tracking::{DetectionLog, TrackingInput, TrackingModel};
use crate::writer_pool::WriterPool;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Where the inputs and outputs of one video live
///
/// For `<root>/<video_id>.<ext>` (or an image directory `<root>/<video_id>`):
/// detections are read from `<root>/<video_id>/json/pose.json` and shards
/// are written to `<root>/<video_id>/shards/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoLayout {
    pub video_path: PathBuf,
    pub video_id: String,
    pub detection_log: PathBuf,
    pub shard_dir: PathBuf,
}

impl VideoLayout {
    pub fn for_video<P: AsRef<Path>>(video_path: P) -> Result<Self> {
        let video_path = video_path.as_ref().to_path_buf();
        let file_name = video_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                WindowingError::config(format!("{} has no file name", video_path.display()))
            })?;
        let video_id = file_name
            .split('.')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                WindowingError::config(format!("cannot derive video id from {}", file_name))
            })?
            .to_string();

        let base = video_path
            .parent()
            .map(|p| p.join(&video_id))
            .unwrap_or_else(|| PathBuf::from(&video_id));
        Ok(Self {
            detection_log: base.join("json").join("pose.json"),
            shard_dir: base.join("shards"),
            video_path,
            video_id,
        })
    }

    pub fn has_detection_log(&self) -> bool {
        self.detection_log.is_file()
    }

    /// Open the frames: a directory is read as an image sequence, a file is decoded as video
    pub fn open_source(&self) -> Result<Box<dyn FrameSource>> {
        if self.video_path.is_dir() {
            return Ok(Box::new(ImageSequenceSource::open(&self.video_path)?));
        }
        open_video_file(&self.video_path)
    }
}

#[cfg(feature = "opencv")]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(crate::video::VideoFileSource::open(path)?))
}

#[cfg(not(feature = "opencv"))]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>> {
    Err(WindowingError::config(format!(
        "decoding {} needs the `opencv` feature; pass a directory of frames instead",
        path.display()
    )))
}

/// Outcome of one shard-creation run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub video_id: String,
    pub frame_count: usize,
    pub windows_expected: usize,
    /// Keys of written windows, ordered by window end
    pub succeeded: Vec<String>,
    /// `(key, reason)` for every window that failed
    pub failed: Vec<(String, String)>,
    pub shards: Vec<PathBuf>,
    pub progress: ProgressSnapshot,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.succeeded.len() == self.windows_expected
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} frames, {}/{} windows written, {} failed, {} shards in {:.1}s",
            self.video_id,
            self.frame_count,
            self.succeeded.len(),
            self.windows_expected,
            self.failed.len(),
            self.shards.len(),
            self.elapsed.as_secs_f32()
        )?;
        for (key, reason) in &self.failed {
            writeln!(f, "  failed {}: {}", key, reason)?;
        }
        Ok(())
    }
}

/// Create the shards of one video laid out as described by [`VideoLayout`]
///
/// `model` is only used when no detection log exists for the video.
pub fn create_shards<P: AsRef<Path>>(
    video_path: P,
    config: &WindowConfig,
    estimator: Box<dyn FlowEstimator>,
    model: Option<Box<dyn TrackingModel>>,
) -> Result<RunReport> {
    config.validate()?;
    let layout = VideoLayout::for_video(video_path)?;
    let source = layout.open_source()?;

    let tracking = if layout.has_detection_log() {
        let mut log = DetectionLog::load(&layout.detection_log)?;
        log.truncate(source.frame_count());
        TrackingInput::Replay(log)
    } else if let Some(model) = model {
        TrackingInput::Live(model)
    } else {
        return Err(WindowingError::config(format!(
            "no detection log at {} and no tracking model given",
            layout.detection_log.display()
        )));
    };

    run_pipeline(
        &layout.video_id,
        source,
        estimator,
        tracking,
        &layout.shard_dir,
        config,
    )
}

/// Run the concurrent windowing pipeline over `source`, writing shards to `shard_dir`
pub fn run_pipeline(
    video_id: &str,
    source: Box<dyn FrameSource>,
    estimator: Box<dyn FlowEstimator>,
    tracking: TrackingInput,
    shard_dir: &Path,
    config: &WindowConfig,
) -> Result<RunReport> {
    config.validate()?;
    let start = Instant::now();
    let frame_count = source.frame_count();
    let (width, height) = source.frame_size();
    log::info!(
        "Creating shards for {} from {} ({} frames, {}x{}, tracking: {})",
        video_id,
        source.name(),
        frame_count,
        width,
        height,
        tracking.describe()
    );

    config.to_json_file(&shard_dir.join("config.json"))?;
    let writer = Arc::new(Mutex::new(ShardWriter::new(shard_dir, config)?));
    let progress = Arc::new(Progress::new(config.progress_log_interval));
    let shared = Arc::new(SharedState::new(
        source,
        config.capacity(),
        config.poll_interval(),
    )?);
    let pool = WriterPool::new(config.workers(), config.pending_limit(), Arc::clone(&writer))?;

    let flow = OpticalFlowProducer::new(estimator).spawn(Arc::clone(&shared), Arc::clone(&progress))?;
    let track = match TrackingProducer::new(tracking).spawn(Arc::clone(&shared), Arc::clone(&progress)) {
        Ok(handle) => handle,
        Err(e) => {
            shared.abort();
            let _ = flow.join();
            return Err(e);
        }
    };

    let tally = WindowCoordinator::new(
        config.clone(),
        video_id,
        shared,
        pool,
        Arc::clone(&progress),
    )
    .run(vec![flow, track])?;

    let shards = writer
        .lock()
        .map_err(|_| WindowingError::poisoned("shard writer"))?
        .finish()?;

    let report = RunReport {
        video_id: video_id.to_string(),
        frame_count,
        windows_expected: config.expected_window_ends(frame_count).len(),
        succeeded: tally.succeeded_keys(),
        failed: tally.failed,
        shards,
        progress: progress.snapshot(),
        elapsed: start.elapsed(),
    };
    log::info!("{}", report.to_string().trim_end());
    Ok(report)
}
