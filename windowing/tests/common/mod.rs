#![allow(dead_code)]

use dstg_windowing::{
    BoundingBox, Detection, FlowEstimator, FlowField, Frame, LucasKanadeFlow, MemoryFrameSource,
    Result, RunReport, ShardReader, TrackingInput, TrackingModel, WindowConfig, WindowRecord,
    WindowingError, NUM_KEYPOINTS,
};
use std::path::Path;
use std::time::Duration;

pub const WIDTH: usize = 8;
pub const HEIGHT: usize = 8;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config(seq_len: usize, stride: usize) -> WindowConfig {
    let mut config = WindowConfig::new(seq_len, stride);
    config.num_workers = Some(3);
    config.poll_interval_ms = 1;
    config.progress_log_interval = 0;
    config
}

pub fn person(id: u32, x: f32, y: f32) -> Detection {
    let mut keypoints = [[0.0; 2]; NUM_KEYPOINTS];
    for (k, kp) in keypoints.iter_mut().enumerate() {
        *kp = [x + k as f32, y + 2.0 * k as f32];
    }
    Detection::new(id, BoundingBox::new(x, y, x + 10.0, y + 30.0), keypoints)
}

/// Who is visible in `frame_index` under the scripted scene
///
/// - id 1 is always visible,
/// - id 2 is missing on every third frame,
/// - id 3 walks through frames 10..40.
pub fn scripted_detections(frame_index: usize) -> Vec<Detection> {
    let x = frame_index as f32;
    let mut people = vec![person(1, x, 0.0)];
    if frame_index % 3 != 0 {
        people.push(person(2, 50.0, x));
    }
    if (10..40).contains(&frame_index) {
        people.push(person(3, 2.0 * x, 20.0));
    }
    people
}

/// Deterministic stand-in for a detector plus tracker
pub struct ScriptedTracker {
    /// Optional pause per frame to make the stage slower than flow
    pub delay: Option<Duration>,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self { delay: None }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

impl TrackingModel for ScriptedTracker {
    fn predict(&mut self, frame: &Frame, frame_index: usize) -> Result<Vec<Detection>> {
        assert_eq!(frame.index, frame_index);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        // reverse order so the pipeline has to sort by id
        let mut people = scripted_detections(frame_index);
        people.reverse();
        Ok(people)
    }

    fn name(&self) -> &str {
        "scripted tracker"
    }
}

/// Tracker whose model fails at a given frame
pub struct FailingTracker {
    pub fail_at: usize,
}

impl TrackingModel for FailingTracker {
    fn predict(&mut self, _frame: &Frame, frame_index: usize) -> Result<Vec<Detection>> {
        if frame_index == self.fail_at {
            return Err(WindowingError::tracking("CUDA out of memory"));
        }
        Ok(scripted_detections(frame_index))
    }
}

/// Tracker that hangs for a long time at a given frame
pub struct HangingTracker {
    pub hang_at: usize,
    pub hang_for: Duration,
}

impl TrackingModel for HangingTracker {
    fn predict(&mut self, _frame: &Frame, frame_index: usize) -> Result<Vec<Detection>> {
        if frame_index == self.hang_at {
            std::thread::sleep(self.hang_for);
        }
        Ok(scripted_detections(frame_index))
    }
}

/// Flow estimator that fails at a given frame
pub struct FailingFlow {
    pub fail_at: usize,
}

impl FlowEstimator for FailingFlow {
    fn compute(&mut self, _prev: &Frame, frame: &Frame) -> Result<FlowField> {
        if frame.index == self.fail_at {
            return Err(WindowingError::flow("estimator diverged"));
        }
        Ok(FlowField::zeros(frame.index, frame.height(), frame.width()))
    }
}

pub fn synthetic_source(frames: usize) -> Box<MemoryFrameSource> {
    Box::new(MemoryFrameSource::synthetic(frames, WIDTH, HEIGHT))
}

pub fn live(model: impl TrackingModel + 'static) -> TrackingInput {
    TrackingInput::Live(Box::new(model))
}

pub fn lucas_kanade() -> Box<LucasKanadeFlow> {
    Box::new(LucasKanadeFlow::default())
}

/// Every record of every shard of a run, sorted by window end
pub fn read_records(report: &RunReport) -> Vec<WindowRecord> {
    let mut records: Vec<WindowRecord> = report
        .shards
        .iter()
        .flat_map(|path| ShardReader::open(path).unwrap().records().unwrap())
        .collect();
    records.sort_by_key(|r| r.meta.window_end);
    records
}

pub fn shard_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tar"))
        .collect();
    names.sort();
    names
}
